//! SCSI Media Changer (SMC) command building and page decoding.
//!
//! The CONTROL agent drives robots exclusively through
//! `SCSI_EXECUTE_CDB`; this module supplies the CDBs it sends and
//! decodes the pages that come back. The changer simulator uses the
//! encode half to answer the same CDBs.

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;

pub const SCSI_CMD_INQUIRY: u8 = 0x12;
pub const SCSI_CMD_MODE_SENSE6: u8 = 0x1A;
pub const SCSI_CMD_INIT_ELEMENT_STATUS: u8 = 0x07;
pub const SCSI_CMD_MOVE_MEDIUM: u8 = 0xA5;
pub const SCSI_CMD_READ_ELEMENT_STATUS: u8 = 0xB8;

pub const ELEMENT_ADDRESS_ASSIGNMENT_PAGE: u8 = 0x1D;

/// SMC element type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    MediumTransport = 1,
    Storage = 2,
    ImportExport = 3,
    DataTransfer = 4,
}

impl ElementType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ElementType::MediumTransport),
            2 => Some(ElementType::Storage),
            3 => Some(ElementType::ImportExport),
            4 => Some(ElementType::DataTransfer),
            _ => None,
        }
    }
}

/// Decoded element descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ElementDescriptor {
    pub element_address: u16,
    pub element_type: ElementType,
    pub full: bool,
    pub except: bool,
    pub svalid: bool,
    pub src_se_addr: u16,
}

/// Element address assignments from the changer's mode page.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementAddressAssignment {
    pub mte_addr: u16,
    pub mte_count: u16,
    pub se_addr: u16,
    pub se_count: u16,
    pub iee_addr: u16,
    pub iee_count: u16,
    pub dte_addr: u16,
    pub dte_count: u16,
}

/// INQUIRY identity of the robot.
#[derive(Debug, Clone, Default)]
pub struct InquiryInfo {
    pub peripheral_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

/*
 * CDB builders
 */

pub fn inquiry_cdb(allocation_len: u8) -> Vec<u8> {
    vec![SCSI_CMD_INQUIRY, 0, 0, 0, allocation_len, 0]
}

pub fn mode_sense_element_address_cdb() -> Vec<u8> {
    let allocation_len: u8 = u8::MAX;
    vec![
        SCSI_CMD_MODE_SENSE6,
        0x08, // DBD=1, no block descriptors
        ELEMENT_ADDRESS_ASSIGNMENT_PAGE,
        0,
        allocation_len,
        0,
    ]
}

pub fn initialize_element_status_cdb() -> Vec<u8> {
    vec![SCSI_CMD_INIT_ELEMENT_STATUS, 0, 0, 0, 0, 0]
}

pub fn move_medium_cdb(
    medium_transport_address: u16,
    source_element_address: u16,
    destination_element_address: u16,
) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.push(SCSI_CMD_MOVE_MEDIUM);
    cmd.push(0); // reserved
    cmd.extend(medium_transport_address.to_be_bytes());
    cmd.extend(source_element_address.to_be_bytes());
    cmd.extend(destination_element_address.to_be_bytes());
    cmd.push(0); // reserved
    cmd.push(0); // reserved
    cmd.push(0); // Invert=0
    cmd.push(0); // control
    cmd
}

pub fn read_element_status_cdb(
    start_element_address: u16,
    number_of_elements: u16,
    allocation_len: u32,
) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.push(SCSI_CMD_READ_ELEMENT_STATUS);
    cmd.push(0); // all element types, no volume tags
    cmd.extend(start_element_address.to_be_bytes());
    cmd.extend(number_of_elements.to_be_bytes());
    cmd.push(0); // Mixed=0, CurData=0, DVCID=0
    cmd.extend(&allocation_len.to_be_bytes()[1..4]);
    cmd.push(0);
    cmd.push(0);
    cmd
}

/*
 * Wire structures
 */

#[repr(C, packed)]
#[derive(Endian, Copy, Clone)]
struct ModeParameterHeader6 {
    mode_data_len: u8,
    medium_type: u8,
    flags3: u8,
    block_descriptor_len: u8,
}

#[repr(C, packed)]
#[derive(Endian, Copy, Clone)]
struct AddressAssignmentPage {
    page_code: u8,
    additional_page_len: u8,
    first_transport_element_address: u16,
    transport_element_count: u16,
    first_storage_element_address: u16,
    storage_element_count: u16,
    first_import_export_element_address: u16,
    import_export_element_count: u16,
    first_transfer_element_address: u16,
    transfer_element_count: u16,
    reserved18: u8,
    reserved19: u8,
}

#[repr(C, packed)]
#[derive(Endian, Copy, Clone)]
struct ElementStatusDataHeader {
    first_element_address: u16,
    number_of_elements: u16,
    reserved: u8,
    byte_count: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian, Copy, Clone)]
struct ElementStatusPageHeader {
    type_code: u8,
    flags: u8,
    element_descriptor_length: u16,
    reserved: u8,
    descriptor_byte_count: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian, Copy, Clone)]
struct ElementDescriptorRaw {
    element_address: u16,
    flags: u8,
    reserved3: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved6: [u8; 3],
    flags2: u8,
    source_storage_element_address: u16,
}

const DESCRIPTOR_FLAG_FULL: u8 = 0x01;
const DESCRIPTOR_FLAG_EXCEPT: u8 = 0x04;
const DESCRIPTOR_FLAG2_SVALID: u8 = 0x80;

fn decode_be<T: Endian + Copy>(data: &[u8]) -> Result<T, Error> {
    let size = std::mem::size_of::<T>();
    if data.len() < size {
        bail!("short SCSI page ({} < {})", data.len(), size);
    }
    let mut value = std::mem::MaybeUninit::<T>::uninit();
    let value = unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), value.as_mut_ptr() as *mut u8, size);
        value.assume_init()
    };
    Ok(value.from_be())
}

fn encode_be<T: Endian + Copy>(value: T, out: &mut Vec<u8>) {
    let be = value.to_be();
    let size = std::mem::size_of::<T>();
    let bytes = unsafe { std::slice::from_raw_parts(&be as *const T as *const u8, size) };
    out.extend_from_slice(bytes);
}

fn u24(value: u32) -> [u8; 3] {
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

fn from_u24(bytes: [u8; 3]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn scsi_ascii(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}

/*
 * Decoders (CONTROL side)
 */

pub fn decode_inquiry(data: &[u8]) -> Result<InquiryInfo, Error> {
    if data.len() < 36 {
        bail!("INQUIRY data too short ({})", data.len());
    }
    Ok(InquiryInfo {
        peripheral_type: data[0] & 0x1F,
        vendor: scsi_ascii(&data[8..16]),
        product: scsi_ascii(&data[16..32]),
        revision: scsi_ascii(&data[32..36]),
    })
}

pub fn decode_element_address_assignment(
    data: &[u8],
) -> Result<ElementAddressAssignment, Error> {
    let header: ModeParameterHeader6 = decode_be(data)?;
    if header.block_descriptor_len != 0 {
        bail!("unexpected block descriptor in mode data");
    }
    let page: AddressAssignmentPage = decode_be(&data[4..])?;
    if page.page_code & 0x3F != ELEMENT_ADDRESS_ASSIGNMENT_PAGE {
        bail!("unexpected mode page {:#x}", page.page_code);
    }
    Ok(ElementAddressAssignment {
        mte_addr: page.first_transport_element_address,
        mte_count: page.transport_element_count,
        se_addr: page.first_storage_element_address,
        se_count: page.storage_element_count,
        iee_addr: page.first_import_export_element_address,
        iee_count: page.import_export_element_count,
        dte_addr: page.first_transfer_element_address,
        dte_count: page.transfer_element_count,
    })
}

pub fn decode_element_status(data: &[u8]) -> Result<Vec<ElementDescriptor>, Error> {
    let header: ElementStatusDataHeader = decode_be(data)?;
    let mut remaining = from_u24(header.byte_count) as usize;
    let mut off = std::mem::size_of::<ElementStatusDataHeader>();
    let mut list = Vec::new();

    while remaining > 0 {
        let page: ElementStatusPageHeader = decode_be(&data[off..])?;
        let page_header_len = std::mem::size_of::<ElementStatusPageHeader>();
        off += page_header_len;
        remaining = remaining.saturating_sub(page_header_len);

        let element_type = ElementType::from_code(page.type_code)
            .ok_or_else(|| format_err!("unknown element type code {}", page.type_code))?;
        let descriptor_len = page.element_descriptor_length as usize;
        if descriptor_len < std::mem::size_of::<ElementDescriptorRaw>() {
            bail!("element descriptor too short ({})", descriptor_len);
        }
        let mut page_bytes = from_u24(page.descriptor_byte_count) as usize;

        while page_bytes >= descriptor_len {
            let raw: ElementDescriptorRaw = decode_be(&data[off..])?;
            list.push(ElementDescriptor {
                element_address: raw.element_address,
                element_type,
                full: raw.flags & DESCRIPTOR_FLAG_FULL != 0,
                except: raw.flags & DESCRIPTOR_FLAG_EXCEPT != 0,
                svalid: raw.flags2 & DESCRIPTOR_FLAG2_SVALID != 0,
                src_se_addr: raw.source_storage_element_address,
            });
            off += descriptor_len;
            page_bytes -= descriptor_len;
            remaining = remaining.saturating_sub(descriptor_len);
        }
    }

    Ok(list)
}

/*
 * Encoders (simulator side)
 */

pub fn encode_inquiry(info: &InquiryInfo) -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = info.peripheral_type & 0x1F;
    data[4] = 31; // additional length
    fill_ascii(&mut data[8..16], &info.vendor);
    fill_ascii(&mut data[16..32], &info.product);
    fill_ascii(&mut data[32..36], &info.revision);
    data
}

fn fill_ascii(dest: &mut [u8], text: &str) {
    for b in dest.iter_mut() {
        *b = b' ';
    }
    for (slot, b) in dest.iter_mut().zip(text.bytes()) {
        *slot = b;
    }
}

pub fn encode_element_address_assignment(aa: &ElementAddressAssignment) -> Vec<u8> {
    let mut out = Vec::new();
    let page = AddressAssignmentPage {
        page_code: ELEMENT_ADDRESS_ASSIGNMENT_PAGE,
        additional_page_len: 18,
        first_transport_element_address: aa.mte_addr,
        transport_element_count: aa.mte_count,
        first_storage_element_address: aa.se_addr,
        storage_element_count: aa.se_count,
        first_import_export_element_address: aa.iee_addr,
        import_export_element_count: aa.iee_count,
        first_transfer_element_address: aa.dte_addr,
        transfer_element_count: aa.dte_count,
        reserved18: 0,
        reserved19: 0,
    };
    let header = ModeParameterHeader6 {
        mode_data_len: 3 + std::mem::size_of::<AddressAssignmentPage>() as u8,
        medium_type: 0,
        flags3: 0,
        block_descriptor_len: 0,
    };
    encode_be(header, &mut out);
    encode_be(page, &mut out);
    out
}

pub fn encode_element_status(descriptors: &[ElementDescriptor]) -> Vec<u8> {
    let descriptor_len = std::mem::size_of::<ElementDescriptorRaw>();
    let mut pages = Vec::new();
    let mut total = 0usize;

    for element_type in [
        ElementType::MediumTransport,
        ElementType::Storage,
        ElementType::ImportExport,
        ElementType::DataTransfer,
    ] {
        let members: Vec<&ElementDescriptor> = descriptors
            .iter()
            .filter(|d| d.element_type == element_type)
            .collect();
        if members.is_empty() {
            continue;
        }
        let page_bytes = members.len() * descriptor_len;
        let header = ElementStatusPageHeader {
            type_code: element_type as u8,
            flags: 0,
            element_descriptor_length: descriptor_len as u16,
            reserved: 0,
            descriptor_byte_count: u24(page_bytes as u32),
        };
        encode_be(header, &mut pages);
        for desc in members {
            let mut flags = 0;
            if desc.full {
                flags |= DESCRIPTOR_FLAG_FULL;
            }
            if desc.except {
                flags |= DESCRIPTOR_FLAG_EXCEPT;
            }
            let raw = ElementDescriptorRaw {
                element_address: desc.element_address,
                flags,
                reserved3: 0,
                additional_sense_code: 0,
                additional_sense_code_qualifier: 0,
                reserved6: [0; 3],
                flags2: if desc.svalid { DESCRIPTOR_FLAG2_SVALID } else { 0 },
                source_storage_element_address: desc.src_se_addr,
            };
            encode_be(raw, &mut pages);
        }
        total += std::mem::size_of::<ElementStatusPageHeader>() + page_bytes;
    }

    let first = descriptors
        .iter()
        .map(|d| d.element_address)
        .min()
        .unwrap_or(0);
    let mut out = Vec::new();
    let header = ElementStatusDataHeader {
        first_element_address: first,
        number_of_elements: descriptors.len() as u16,
        reserved: 0,
        byte_count: u24(total as u32),
    };
    encode_be(header, &mut out);
    out.extend_from_slice(&pages);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_element_status_round_trip() {
        let descriptors = vec![
            ElementDescriptor {
                element_address: 0,
                element_type: ElementType::MediumTransport,
                full: false,
                except: false,
                svalid: false,
                src_se_addr: 0,
            },
            ElementDescriptor {
                element_address: 1024,
                element_type: ElementType::Storage,
                full: true,
                except: false,
                svalid: true,
                src_se_addr: 1024,
            },
            ElementDescriptor {
                element_address: 80,
                element_type: ElementType::DataTransfer,
                full: true,
                except: false,
                svalid: true,
                src_se_addr: 1025,
            },
        ];

        let encoded = encode_element_status(&descriptors);
        let decoded = decode_element_status(&encoded).unwrap();

        assert_eq!(decoded.len(), 3);
        let drive = decoded
            .iter()
            .find(|d| d.element_type == ElementType::DataTransfer)
            .unwrap();
        assert!(drive.full && drive.svalid);
        assert_eq!(drive.src_se_addr, 1025);
        assert_eq!(drive.element_address, 80);
    }

    #[test]
    fn test_address_assignment_round_trip() {
        let aa = ElementAddressAssignment {
            mte_addr: 0,
            mte_count: 1,
            se_addr: 1024,
            se_count: 10,
            iee_addr: 768,
            iee_count: 1,
            dte_addr: 80,
            dte_count: 2,
        };
        let encoded = encode_element_address_assignment(&aa);
        let decoded = decode_element_address_assignment(&encoded).unwrap();
        assert_eq!(decoded.se_addr, 1024);
        assert_eq!(decoded.se_count, 10);
        assert_eq!(decoded.dte_addr, 80);
    }

    #[test]
    fn test_inquiry_round_trip() {
        let info = InquiryInfo {
            peripheral_type: 8,
            vendor: "NDMPSIM".into(),
            product: "MEDIA CHANGER".into(),
            revision: "0100".into(),
        };
        let decoded = decode_inquiry(&encode_inquiry(&info)).unwrap();
        assert_eq!(decoded.peripheral_type, 8);
        assert_eq!(decoded.vendor, "NDMPSIM");
        assert_eq!(decoded.product, "MEDIA CHANGER");
    }
}

//! Formatter child process plumbing (pipe and spawn).
//!
//! The formatter speaks three pipes: the image pipe (stdout for
//! backup, stdin for recovery), stderr (mirrored as NDMP log
//! messages), and the wrap channel on fd 3 (file history and
//! environment updates in a line oriented protocol). Descriptors
//! above 3 never reach the child.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use anyhow::{format_err, Error};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::chan::Chan;

const FMT_IMAGE_BUF: usize = 8 * 1024;
const FMT_ERROR_BUF: usize = 8 * 1024;
const FMT_WRAP_BUF: usize = 4 * 1024;

pub struct FormatterChild {
    pub child: Child,
    pub image_chan: Chan,
    pub error_chan: Chan,
    pub wrap_chan: Chan,
    error_line: Vec<u8>,
    wrap_line: Vec<u8>,
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;
    let read_fd = unsafe { OwnedFd::from_raw_fd(read_fd) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(write_fd) };
    Ok((read_fd, write_fd))
}

impl FormatterChild {
    /// Pipe and spawn the formatter command. The command line runs
    /// under `/bin/sh -c`, as assembled by the embedder with the
    /// escape helpers below.
    pub fn spawn(cmd: &str, is_backup: bool) -> Result<Self, Error> {
        log::info!("Starting {}", cmd);

        let (err_read, err_write) = make_pipe()?;
        let (dat_read, dat_write) = make_pipe()?;
        let (wrap_read, wrap_write) = make_pipe()?;

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(cmd);
        command.stderr(Stdio::from(err_write));

        let mut image_chan = Chan::new("dfp-image");
        image_chan.set_buffer(FMT_IMAGE_BUF);

        if is_backup {
            command.stdin(Stdio::null());
            command.stdout(Stdio::from(dat_write));
            image_chan.start_read(dat_read);
        } else {
            command.stdin(Stdio::from(dat_read));
            command.stdout(Stdio::null());
            image_chan.start_write(dat_write);
        }

        // fd 3 is reserved for the wrap protocol; everything higher
        // is close-on-exec
        let wrap_raw = wrap_write.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(wrap_raw, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|err| format_err!("formatter spawn failed: {}", err))?;
        drop(wrap_write);

        let mut error_chan = Chan::new("dfp-error");
        error_chan.set_buffer(FMT_ERROR_BUF);
        error_chan.start_read(err_read);

        let mut wrap_chan = Chan::new("dfp-wrap");
        wrap_chan.set_buffer(FMT_WRAP_BUF);
        wrap_chan.start_read(wrap_read);

        Ok(FormatterChild {
            child,
            image_chan,
            error_chan,
            wrap_chan,
            error_line: Vec::new(),
            wrap_line: Vec::new(),
        })
    }

    /// Completed stderr lines buffered so far.
    pub fn take_error_lines(&mut self) -> Vec<String> {
        take_lines(&mut self.error_chan, &mut self.error_line)
    }

    /// Completed wrap-protocol lines buffered so far.
    pub fn take_wrap_lines(&mut self) -> Vec<String> {
        take_lines(&mut self.wrap_chan, &mut self.wrap_line)
    }

    /// Non-blocking exit status check, once finished the result is
    /// sticky in the Child.
    pub fn poll_exit(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(_) => Some(-1),
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn take_lines(chan: &mut Chan, partial: &mut Vec<u8>) -> Vec<String> {
    let n = chan.n_ready();
    if n > 0 {
        partial.extend_from_slice(chan.peek());
        chan.consume(n);
    }
    let mut lines = Vec::new();
    while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = partial.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        lines.push(text);
    }
    lines
}

/*
 * Shell command assembly with metacharacter escaping
 */

pub const CMD_SPECIAL: &str = " \t`'\"*?[]$";
pub const CMD_SPECIAL_ALLOW_WILDCARDS: &str = " \t`'\"$";

pub fn add_to_cmd_with_escapes(cmd: &mut String, word: &str, special: &str) {
    if !cmd.is_empty() {
        cmd.push(' ');
    }
    for c in word.chars() {
        if c == '\\' || special.contains(c) {
            cmd.push('\\');
        }
        cmd.push(c);
    }
}

pub fn add_to_cmd(cmd: &mut String, word: &str) {
    add_to_cmd_with_escapes(cmd, word, CMD_SPECIAL);
}

pub fn add_to_cmd_allow_file_wildcards(cmd: &mut String, word: &str) {
    add_to_cmd_with_escapes(cmd, word, CMD_SPECIAL_ALLOW_WILDCARDS);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cmd_escaping() {
        let mut cmd = String::new();
        add_to_cmd(&mut cmd, "tar");
        add_to_cmd(&mut cmd, "cf");
        add_to_cmd(&mut cmd, "/tmp/odd name$x");
        assert_eq!(cmd, "tar cf /tmp/odd\\ name\\$x");

        let mut cmd = String::new();
        add_to_cmd_allow_file_wildcards(&mut cmd, "*.log");
        assert_eq!(cmd, "*.log");
    }

    #[test]
    fn test_line_splitter() {
        let mut chan = Chan::new("t");
        chan.set_buffer(64);
        let mut partial = Vec::new();

        chan.put(b"first\nsec");
        let lines = take_lines(&mut chan, &mut partial);
        assert_eq!(lines, vec!["first".to_string()]);

        chan.put(b"ond\n");
        let lines = take_lines(&mut chan, &mut partial);
        assert_eq!(lines, vec!["second".to_string()]);
    }
}

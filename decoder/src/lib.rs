//! Wrapper around the external packet decoder tool.
//!
//! The decoder is an opaque command-line program (tshark-compatible flags)
//! that can rewrite a capture with TCP stream reassembly and IPv4/IPv6
//! defragmentation applied. It is spawned per input file, bounded by a
//! timeout, and killed when the timeout expires. The analyzer works on the
//! reassembled copy; [`mapping`] relates its frames back to the original.

pub mod mapping;

use anyhow::{bail, Context as _, Error};
use log::{debug, warn};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use wait_timeout::ChildExt;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct Decoder {
    program: PathBuf,
    timeout: Duration,
    /// Ports decoded as TLS in addition to the protocol default.
    tls_ports: Vec<u16>,
}

impl Decoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
            tls_ports: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tls_ports(mut self, ports: &[u16]) -> Self {
        self.tls_ports = ports.to_vec();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Verify the tool can be started at all; returns its version banner.
    pub fn probe(&self) -> Result<String, Error> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("decoder '{}' could not be started", self.program.display()))?;
        if !output.status.success() {
            bail!(
                "decoder '{}' exited with {} during the version probe",
                self.program.display(),
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    /// Write a reassembled copy of `input` to `output`: TCP streams
    /// desegmented, IPv4 and IPv6 fragments merged, extra ports decoded as
    /// TLS.
    pub fn reassemble(&self, input: &Path, output: &Path) -> Result<(), Error> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-r")
            .arg(input)
            .arg("-w")
            .arg(output)
            .args(&["-o", "tcp.desegment_tcp_streams:TRUE"])
            .args(&["-o", "ip.defragment:TRUE"])
            .args(&["-o", "ipv6.defragment:TRUE"]);
        for port in &self.tls_ports {
            cmd.arg("-d").arg(format!("tcp.port=={},tls", port));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        suppress_console_window(&mut cmd);
        debug!("running decoder: {:?}", cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("starting decoder '{}'", self.program.display()))?;
        match child
            .wait_timeout(self.timeout)
            .context("waiting for the decoder")?
        {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                let mut stderr = String::new();
                if let Some(pipe) = child.stderr.as_mut() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                bail!(
                    "decoder exited with {}: {}",
                    status,
                    stderr.lines().next().unwrap_or("<no output>")
                );
            }
            None => {
                warn!(
                    "decoder exceeded {}s on {}, killing it",
                    self.timeout.as_secs(),
                    input.display()
                );
                let _ = child.kill();
                // Reap to avoid leaving a zombie behind.
                let _ = child.wait();
                bail!(
                    "decoder timed out after {}s on {}",
                    self.timeout.as_secs(),
                    input.display()
                );
            }
        }
    }
}

/// The decoder runs headless; on Windows a plain spawn would flash a console
/// window for every file.
#[cfg(windows)]
fn suppress_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn suppress_console_window(_cmd: &mut Command) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_probe_missing_program() {
        let decoder = Decoder::new("/nonexistent/decoder-binary");
        assert!(decoder.probe().is_err());
    }

    #[test]
    fn test_reassemble_missing_program() {
        let decoder = Decoder::new("/nonexistent/decoder-binary");
        let err = decoder
            .reassemble(Path::new("in.pcap"), Path::new("out.pcap"))
            .unwrap_err();
        assert!(err.to_string().contains("starting decoder"));
    }
}

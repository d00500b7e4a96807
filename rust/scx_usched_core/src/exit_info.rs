// Copyright (c) Andrea Righi <andrea.righi@linux.dev>

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::bail;
use anyhow::Result;
use log::info;

use crate::error::LayoutError;

pub const UEI_REASON_LEN: usize = 128;
pub const UEI_MSG_LEN: usize = 1024;

/// Exit code bit set by the BPF component when the scheduler should be restarted (e.g. after a
/// CPU hotplug event).
pub const SCX_ECODE_ACT_RESTART: i64 = 1 << 48;

/// Values of the C enum scx_exit_kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScxExitKind {
    None = 0,
    Done = 1,
    Unreg = 64,
    UnregBpf = 65,
    UnregKern = 66,
    SysRq = 67,
    Error = 1024,
    ErrorBpf = 1025,
    ErrorStall = 1026,
}

/// Rust counterpart of C struct user_exit_info.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// The C enum scx_exit_kind value. Non-zero value indicates that the BPF scheduler has
    /// exited.
    pub kind: i32,
    pub exit_code: i64,
    pub reason: Option<String>,
    pub msg: Option<String>,
}

fn c_string(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned()).filter(|s| !s.is_empty())
}

impl ExitInfo {
    pub const SIZE: usize = 16 + UEI_REASON_LEN + UEI_MSG_LEN;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LayoutError> {
        if buf.len() < Self::SIZE {
            return Err(LayoutError {
                record: "user_exit_info",
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&buf[0..4]);
        let mut exit_code = [0u8; 8];
        exit_code.copy_from_slice(&buf[8..16]);
        let reason = &buf[16..16 + UEI_REASON_LEN];
        let msg = &buf[16 + UEI_REASON_LEN..Self::SIZE];

        Ok(Self {
            kind: i32::from_le_bytes(kind),
            exit_code: i64::from_le_bytes(exit_code),
            reason: c_string(reason),
            msg: c_string(msg),
        })
    }

    /// Kernel-side encoding, used by the simulator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..16].copy_from_slice(&self.exit_code.to_le_bytes());
        for (text, off, len) in [
            (&self.reason, 16, UEI_REASON_LEN),
            (&self.msg, 16 + UEI_REASON_LEN, UEI_MSG_LEN),
        ] {
            if let Some(text) = text {
                // Keep the terminating NUL.
                let n = text.len().min(len - 1);
                buf[off..off + n].copy_from_slice(&text.as_bytes()[..n]);
            }
        }
        buf
    }

    /// Whether the BPF component stopped the scheduler.
    pub fn exited(&self) -> bool {
        self.kind != ScxExitKind::None as i32 || self.exit_code != 0
    }

    pub fn should_restart(&self) -> bool {
        self.exit_code & SCX_ECODE_ACT_RESTART != 0
    }

    /// Log the exit message if the exit was normal. After an error exit, return an error
    /// containing the exit message instead.
    pub fn report(&self) -> Result<()> {
        if self.kind == ScxExitKind::None as i32 {
            return Ok(());
        }

        let why = match (&self.reason, &self.msg) {
            (Some(reason), None) => format!("EXIT: {}", reason),
            (Some(reason), Some(msg)) => format!("EXIT: {} ({})", reason, msg),
            _ => "<UNKNOWN>".into(),
        };

        if self.kind < ScxExitKind::Error as i32 {
            info!("{} (kind={} code={:#x})", why, self.kind, self.exit_code);
            Ok(())
        } else {
            bail!("{} (kind={} code={:#x})", why, self.kind, self.exit_code)
        }
    }
}

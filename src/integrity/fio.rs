//! fio job construction and output classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Checksum algorithms fio can tag and verify blocks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
    Md5,
    Crc64,
    Crc32c,
    Crc32cIntel,
    Crc32,
    Crc16,
    Crc7,
    Xxhash,
    Sha512,
    Sha256,
    Sha1,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 11] = [
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Crc64,
        ChecksumAlgorithm::Crc32c,
        ChecksumAlgorithm::Crc32cIntel,
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Crc16,
        ChecksumAlgorithm::Crc7,
        ChecksumAlgorithm::Xxhash,
        ChecksumAlgorithm::Sha512,
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Sha1,
    ];

    /// Name as passed to `--verify=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Crc64 => "crc64",
            ChecksumAlgorithm::Crc32c => "crc32c",
            ChecksumAlgorithm::Crc32cIntel => "crc32c-intel",
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Crc16 => "crc16",
            ChecksumAlgorithm::Crc7 => "crc7",
            ChecksumAlgorithm::Xxhash => "xxhash",
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha1 => "sha1",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ChecksumAlgorithm::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| Error::Config(format!("unknown checksum algorithm: {}", s)))
    }
}

/// Pause between block batches, slowing a workload down so that a fault
/// lands while it is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    pub micros: u64,
    pub blocks: u32,
}

impl ThinkTime {
    pub fn new(micros: u64, blocks: u32) -> Self {
        Self { micros, blocks }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FioPhase {
    Write,
    Verify,
}

impl FioPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FioPhase::Write => "write",
            FioPhase::Verify => "verify",
        }
    }
}

/// A single fio invocation against a block device.
#[derive(Debug, Clone)]
pub struct FioJob {
    device: String,
    phase: FioPhase,
    algorithm: ChecksumAlgorithm,
    think_time: Option<ThinkTime>,
}

impl FioJob {
    pub fn write(device: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            device: device.into(),
            phase: FioPhase::Write,
            algorithm,
            think_time: None,
        }
    }

    pub fn verify(device: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            device: device.into(),
            phase: FioPhase::Verify,
            algorithm,
            think_time: None,
        }
    }

    /// Only applied to the write phase.
    pub fn with_think_time(mut self, think_time: Option<ThinkTime>) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn phase(&self) -> FioPhase {
        self.phase
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Full command line, `fio` included.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "fio".into(),
            "--name=benchtest".into(),
            "--verify_fatal=1".into(),
            "--verify_async=2".into(),
            format!("--filename={}", self.device),
            "--direct=1".into(),
            "--ioengine=libaio".into(),
            "--bs=4k".into(),
            "--iodepth=16".into(),
            "--numjobs=1".into(),
        ];
        match self.phase {
            FioPhase::Write => {
                args.push("--rw=randwrite".into());
                args.push("--do_verify=0".into());
                args.push(format!("--verify={}", self.algorithm));
                args.push("--verify_pattern=%o".into());
                if let Some(think) = self.think_time {
                    args.push(format!("--thinktime={}", think.micros));
                    args.push(format!("--thinktime_blocks={}", think.blocks));
                }
            }
            FioPhase::Verify => {
                args.push("--rw=randread".into());
                args.push(format!("--verify={}", self.algorithm));
            }
        }
        args
    }
}

/// True if fio output reports a verification failure.
pub fn is_verify_failure(output: &str) -> bool {
    output.contains("verify:") || output.contains("bad magic header")
}

/// First line of fio output naming the verification failure, if any.
pub fn verify_failure_line(output: &str) -> Option<&str> {
    output
        .lines()
        .find(|l| l.contains("verify:") || l.contains("bad magic header"))
        .map(str::trim)
}

//! Scripted serial-bus peer for protocol tests.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// A scripted device on the far end of an in-memory serial bus.
///
/// Speaks the shared-bus line convention: identify, acquire with a busy
/// estimate, indexed value segments, trailing XOR checksum. Configurable
/// misbehavior covers the retry paths: corrupt checksums for the first N
/// attempts, or total silence.
pub struct SimBusPeer {
    /// Bus address the peer answers on.
    pub address: char,
    /// Signature substring included in the identify reply.
    pub signature: String,
    /// Per-segment payloads, checksum appended to the last automatically.
    pub segment_payloads: Vec<String>,
    /// Busy estimate returned from the acquire command, milliseconds.
    pub busy_ms: u64,
    /// Number of reads to answer with a corrupted checksum.
    pub bad_checksums: u32,
    /// Ignore every command (dead device).
    pub silent: bool,
}

impl SimBusPeer {
    /// A well-behaved peer with the given payloads.
    pub fn healthy(address: char, signature: &str, segment_payloads: Vec<String>) -> Self {
        Self {
            address,
            signature: signature.to_string(),
            segment_payloads,
            busy_ms: 1,
            bad_checksums: 0,
            silent: false,
        }
    }

    /// Corrupt the first `n` reads' checksums.
    pub fn with_bad_checksums(mut self, n: u32) -> Self {
        self.bad_checksums = n;
        self
    }

    /// Never answer anything.
    pub fn with_silence(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Spawn the peer task, returning the near end of the bus.
    pub fn spawn(self) -> DuplexStream {
        let (near, far) = tokio::io::duplex(512);
        tokio::spawn(self.run(far));
        near
    }

    async fn run(self, stream: DuplexStream) {
        let mut corrupt_remaining = self.bad_checksums;
        let mut reader = BufReader::new(stream);
        let full_payload: String = self.segment_payloads.concat();
        let good_sum = full_payload.bytes().fold(0u8, |acc, b| acc ^ b);

        loop {
            let mut raw = Vec::new();
            match reader.read_until(b'\r', &mut raw).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if self.silent {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            let cmd = line.trim_end_matches('\r');
            let Some(body) = cmd.strip_prefix(self.address) else {
                continue; // addressed to someone else
            };

            let reply = match body {
                "I" => Some(format!("{}{}\r", self.address, self.signature)),
                "M" => Some(format!("{}{}\r", self.address, self.busy_ms)),
                "S" | "W" => Some(format!("{}\r", self.address)),
                _ if body.starts_with('D') => {
                    body[1..].parse::<usize>().ok().and_then(|index| {
                        self.segment_payloads.get(index).map(|payload| {
                            if index + 1 == self.segment_payloads.len() {
                                let sum = if corrupt_remaining > 0 {
                                    corrupt_remaining -= 1;
                                    good_sum ^ 0xFF
                                } else {
                                    good_sum
                                };
                                format!("{}{}*{:02X}\r", self.address, payload, sum)
                            } else {
                                format!("{}{}\r", self.address, payload)
                            }
                        })
                    })
                }
                _ => None,
            };

            if let Some(reply) = reply {
                if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

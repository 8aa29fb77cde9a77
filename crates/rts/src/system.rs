//! The system information record sent once when the kernel starts.

/// Record identifier for the system information record.
pub const SYSTEM_INFO: u8 = 64;

/// Static shape of the kernel the stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub version: u16,
    pub processors: u8,
    pub schedulers: u8,
    pub max_tasks: u16,
    pub max_priority: u8,
    pub ticks_per_timeslice: u32,
}

impl SystemInfo {
    pub fn payload(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(11);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.push(self.processors);
        bytes.push(self.schedulers);
        bytes.extend_from_slice(&self.max_tasks.to_le_bytes());
        bytes.push(self.max_priority);
        bytes.extend_from_slice(&self.ticks_per_timeslice.to_le_bytes());
        bytes
    }

    pub fn from_payload(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 11 {
            return None;
        }
        Some(Self {
            version: u16::from_le_bytes([bytes[0], bytes[1]]),
            processors: bytes[2],
            schedulers: bytes[3],
            max_tasks: u16::from_le_bytes([bytes[4], bytes[5]]),
            max_priority: bytes[6],
            ticks_per_timeslice: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
        })
    }
}

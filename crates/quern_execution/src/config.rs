use quern_error::{QuernError, Result};

pub const DEFAULT_WORK_MEM: usize = 4 * 1024 * 1024;
pub const DEFAULT_SPILL_PARTITIONS: usize = 32;
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 64 * 1024;

/// Execution configuration for an operator instance.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Memory budget for a single hash table before it spills.
    pub work_mem: usize,
    /// Number of batch files a spill set starts with.
    pub spill_partitions: usize,
    /// Capacity in bytes of each redistribution ring buffer.
    pub ring_buffer_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            work_mem: DEFAULT_WORK_MEM,
            spill_partitions: DEFAULT_SPILL_PARTITIONS,
            ring_buffer_capacity: DEFAULT_RING_BUFFER_CAPACITY,
        }
    }
}

impl ExecConfig {
    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "work_mem" => self.work_mem = parse_usize(name, value)?,
            "spill_partitions" => self.spill_partitions = parse_usize(name, value)?,
            "ring_buffer_capacity" => self.ring_buffer_capacity = parse_usize(name, value)?,
            other => return Err(QuernError::new(format!("Missing setting for '{other}'"))),
        }
        Ok(())
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        Ok(match name {
            "work_mem" => self.work_mem.to_string(),
            "spill_partitions" => self.spill_partitions.to_string(),
            "ring_buffer_capacity" => self.ring_buffer_capacity.to_string(),
            other => return Err(QuernError::new(format!("Missing setting for '{other}'"))),
        })
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| QuernError::new(format!("Invalid value for '{name}': {value}")))
}

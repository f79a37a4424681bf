//! Thread pinning
//!
//! Receive loops poll their endpoints; pinning them to configured cores
//! keeps the polling off the housekeeping CPUs. A negative core id leaves
//! the thread where the scheduler put it.

use crate::error::{EbError, Result};

/// Pin the calling thread to `core`. Negative ids are a no-op.
pub fn pin_current_thread(core: i32) -> Result<()> {
    if core < 0 {
        return Ok(());
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core as usize, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(EbError::Configuration(format!(
                "failed to pin thread to core {core}: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_core_is_noop() {
        pin_current_thread(-1).unwrap();
    }

    #[test]
    fn test_pin_to_core_zero() {
        // Core 0 exists everywhere this runs.
        pin_current_thread(0).unwrap();
    }
}

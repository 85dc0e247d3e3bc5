//! CPU topology and thread affinity.
//!
//! Worker threads of the pipeline are pinned one-per-core so the per-worker
//! accumulators stay in that core's cache; the I/O worker can be pinned to a
//! dedicated core away from compute.
//!
//! Pinning is best-effort: on non-Linux targets, or when the kernel rejects
//! the mask (cgroup restrictions, offline CPUs), the thread keeps running
//! unpinned.

/// Number of online logical CPUs.
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Pin the calling thread to one logical CPU. Returns true on success.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    if cpu >= libc::CPU_SETSIZE as usize {
        return false;
    }
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        log::debug!("sched_setaffinity to CPU {cpu} failed: {err}");
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> bool {
    false
}

/// Pin worker `thread_id` to CPU `thread_id mod num_cpus()`.
pub fn auto_pin_worker(thread_id: usize) -> bool {
    pin_current_thread(thread_id % num_cpus())
}

/// CPU the calling thread is currently running on, if the platform reports it.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        None
    } else {
        Some(cpu as usize)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_cpus() {
        let n = num_cpus();
        eprintln!("online CPUs: {n}");
        assert!(n >= 1);
    }

    #[test]
    fn test_pin_out_of_range_fails() {
        assert!(!pin_current_thread(1 << 20));
    }

    #[test]
    fn test_thread_pinning() {
        let handle = std::thread::spawn(|| {
            let pinned = auto_pin_worker(0);
            eprintln!("Pin worker 0: {}", if pinned { "OK" } else { "N/A" });
            if pinned {
                if let Some(cpu) = current_cpu() {
                    assert_eq!(cpu, 0);
                }
            }
        });
        handle.join().unwrap();
    }
}

use std::io;
use std::mem;
use std::num::NonZeroUsize;

/// Pins the calling kernel thread to the given CPU.
///
/// Failure is reported but not fatal: in cpuset-restricted environments the
/// runtime still works, it just loses core exclusivity.
pub fn pin_to_core(core_id: usize) {
    let cpu = core_id % num_cpus().get();
    // SAFETY: `cpu_set_t` is plain data, and `sched_setaffinity` only reads
    // the set we hand it for the calling thread (pid 0).
    let result = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if result != 0 {
        log::warn!(
            "failed to pin kernel thread to cpu {cpu}: {}",
            io::Error::last_os_error()
        );
    }
}

/// The number of CPUs available to this process.
pub fn num_cpus() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(1).unwrap())
}

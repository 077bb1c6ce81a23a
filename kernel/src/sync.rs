pub mod mutex;

/// Back off while another thread finishes with a page it holds in transit.
#[inline]
pub fn relax() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
    #[cfg(target_os = "none")]
    core::hint::spin_loop();
}

use std::panic;

use crate::pipeline::cleanup_all_regions;

pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // Unlink shared regions before exiting to prevent leaks in /dev/shm
        cleanup_all_regions();

        log::error!("panic: {panic_info}");
        default_hook(panic_info);

        std::process::exit(1);
    }));
}

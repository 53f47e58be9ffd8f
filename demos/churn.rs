//! Allocates 4000 bytes and frees them straight away, over and over, printing
//! every address. Stops on the first null pointer or after the number of
//! iterations given as the first argument (1,000,000 by default).
//!
//! Run with `RUST_LOG=trace` to watch the allocator work.

use rmalloc::Rmalloc;

const REQUEST: usize = 4000;

fn main() {
    env_logger::init();

    let iterations = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(1_000_000);

    let mut allocator = Rmalloc::new();

    for i in 0..iterations {
        let ptr = allocator.allocate(REQUEST);
        println!("{i}: {ptr:?}");

        if ptr.is_null() {
            break;
        }

        allocator.release(ptr);
    }

    allocator.teardown();
}

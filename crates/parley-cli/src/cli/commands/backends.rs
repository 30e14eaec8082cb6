use crate::exit_codes;
use parley_core::BackendRegistry;

pub fn run() -> i32 {
    for name in BackendRegistry::with_defaults().names() {
        println!("{name}");
    }
    exit_codes::SUCCESS
}

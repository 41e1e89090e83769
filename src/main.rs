use std::process::exit;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    exit(rvds::commands::dispatch(args));
}

use std::process;

fn main() {
    if let Err(e) = generate_readme::from_main() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

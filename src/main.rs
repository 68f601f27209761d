fn main() {
    if let Err(err) = bindery::cli::run() {
        eprintln!("bindery: {err}");
        std::process::exit(1);
    }
}

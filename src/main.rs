fn main() {
    if let Err(error) = teamsync_lib::run() {
        eprintln!("teamsync: {error:#}");
        std::process::exit(1);
    }
}

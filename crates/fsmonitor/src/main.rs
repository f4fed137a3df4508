fn main() {
    std::process::exit(fsmonitor_lib::cli::main());
}

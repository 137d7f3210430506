fn main() {
    if let Err(err) = dpos_node::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

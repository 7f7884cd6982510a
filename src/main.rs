use pg_warren::app::{args, logging, run_server};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = args::parse();
    logging::init_logging(&args);
    if let Err(err) = run_server(args) {
        eprintln!("startup failed: {err}");
        std::process::exit(exitcode::CONFIG);
    }
    std::process::exit(exitcode::OK);
}

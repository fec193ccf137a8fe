use std::process::ExitCode;

fn main() -> ExitCode {
    match collection_router::app::run_router(std::env::args().skip(1)) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("route-collections: {err}");
            ExitCode::from(1)
        }
    }
}

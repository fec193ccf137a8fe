use std::process::ExitCode;

fn main() -> ExitCode {
    match collection_router::app::run_endpoint_diff_tool(std::env::args().skip(1)) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("endpoint-diff: {err}");
            ExitCode::from(1)
        }
    }
}

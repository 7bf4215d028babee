use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match deckvault::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

use std::process::ExitCode;

use stacks_queue_core::JobRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    // the stock binary has no job handlers; it serves the maintenance commands
    stacks_buddy::run_main(JobRegistry::new()).await
}

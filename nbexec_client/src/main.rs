use std::process;

use structopt::StructOpt;

mod operations;

/// Triggers job executions on a notebook execution server
#[derive(StructOpt, Debug)]
#[structopt(name = "nbexec-client")]
struct Opt {
    #[structopt(name = "SERVER_URL")]
    server_url: String,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Stage and run a job, print its output
    Exec(ExecuteOperation),
    /// Print the server api version
    Version,
}

#[derive(Debug, StructOpt)]
struct ExecuteOperation {
    #[structopt(name = "JOB_ID")]
    job_id: String,
}

fn main() {
    let opt = Opt::from_args();
    let client = reqwest::blocking::Client::new();

    match opt.operation {
        Operation::Exec(exec) => match operations::execute(&client, &opt.server_url, &exec.job_id) {
            Ok(result) if result.is_success() => println!("{}", result.data),
            Ok(result) => {
                eprintln!("job failed with status {}", result.status_code);
                eprintln!("{}", result.data);
                process::exit(1);
            }
            Err(e) => {
                eprintln!("{}", e);
                process::exit(2);
            }
        },
        Operation::Version => match operations::version(&client, &opt.server_url) {
            Ok(version) => println!("{}", version),
            Err(e) => {
                eprintln!("{}", e);
                process::exit(2);
            }
        },
    }
}

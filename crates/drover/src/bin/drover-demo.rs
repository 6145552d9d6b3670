//! Demo pool: every worker sleeps for a while, then appends one line to a
//! file.
//!
//! ```text
//! drover-demo <workers|auto> <task_ms> <out_file> [shutdown_timeout_ms] [block]
//! ```
//!
//! Send TERM to the supervisor to let the sleeps finish, INT to abandon them,
//! TTIN/TTOU to resize the pool. With `block`, a retiring worker blocks its
//! own runtime for `task_ms` instead of sleeping, so only the supervisor can
//! end it.

use drover::{DroverError, Options, Result, WorkerContext};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::AsyncWriteExt;

fn usage() -> DroverError {
    DroverError::InvalidConfig(
        "usage: drover-demo <workers|auto> <task_ms> <out_file> [shutdown_timeout_ms] [block]"
            .to_string(),
    )
}

struct Demo {
    options: Options,
    task_duration: Duration,
    out_file: PathBuf,
    block_on_retire: bool,
}

fn parse_args() -> Result<Demo> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [workers, task_ms, out_file, rest @ ..] = args.as_slice() else {
        return Err(usage());
    };

    let mut options = Options::from_env()?;
    if workers != "auto" {
        options = options.with_workers(workers.parse()?);
    }
    if let Some(timeout_ms) = rest.first() {
        options = options.with_shutdown_timeout(Duration::from_millis(timeout_ms.parse()?));
    }
    let block_on_retire = match rest.get(1).map(String::as_str) {
        None => false,
        Some("block") => true,
        Some(_) => return Err(usage()),
    };
    Ok(Demo {
        options,
        task_duration: Duration::from_millis(task_ms.parse()?),
        out_file: PathBuf::from(out_file),
        block_on_retire,
    })
}

async fn append_line(out_file: &Path) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(out_file)
        .await?;
    file.write_all(b"run-timeout\n").await?;
    file.flush().await?;
    Ok(())
}

fn main() -> Result<()> {
    drover_tracing::init();
    let Demo {
        options,
        task_duration,
        out_file,
        block_on_retire,
    } = parse_args()?;

    drover::run(
        move |ctx: &WorkerContext| {
            ctx.logger().event("worker started");
            let out_file = out_file.clone();
            let worker = ctx.clone();
            ctx.spawn(async move {
                if block_on_retire {
                    worker.retired().await;
                    std::thread::sleep(task_duration);
                } else {
                    tokio::time::sleep(task_duration).await;
                }
                append_line(&out_file).await
            });
            Ok(())
        },
        options,
    )
}

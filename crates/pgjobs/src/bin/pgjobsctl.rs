use pgjobs::db;
use pgjobs::jobs::{JobConfig, JobStore, Scheduler, WorkerJob};
use pgjobs::tx::TxRetryPolicy;
use serde_json::Value;
use sqlx::PgPool;
use std::env;

const USAGE: &str = "pgjobsctl <command>\n\
     Commands:\n\
     - reset\n\
     - schedule <type> <owner_id> [data_json] [delay_ms]\n\
     - cron <type> <owner_id> <expression> [data_json]\n\
     - cancel <type> <owner_id>\n\
     - show <job_id>\n\
     - list [limit]\n\
     - owner <owner_id> [type] [limit]\n\
     - counts\n\
     - cleanup\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = db::make_pool(&url).await?;
    let scheduler = Scheduler::new(JobStore::new(pool.clone()), TxRetryPolicy::default());
    let store = scheduler.store();

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "schedule" => {
            let mut config = JobConfig::for_type(arg(&args, 2, "type")?, parse_arg(&args, 3, "owner_id")?);
            if let Some(data) = args.get(4) {
                config = config.data(serde_json::from_str(data)?);
            }
            if let Some(delay_ms) = args.get(5) {
                let delay_ms: i64 = delay_ms.parse()?;
                config = config.due(chrono::Utc::now() + chrono::Duration::milliseconds(delay_ms));
            }
            let job = scheduler.schedule_job(config).await?;
            println!("+ scheduled {} id={} due={}", job.job_type, job.id, job.due);
        }
        "cron" => {
            let mut config = JobConfig::for_type(arg(&args, 2, "type")?, parse_arg(&args, 3, "owner_id")?);
            let expression = arg(&args, 4, "expression")?;
            if let Some(data) = args.get(5) {
                config = config.data(serde_json::from_str(data)?);
            }
            let job = scheduler.schedule_cron_job(config, expression).await?;
            println!("+ scheduled cron {} id={} first_due={}", job.job_type, job.id, job.due);
        }
        "cancel" => {
            let job_type = arg(&args, 2, "type")?;
            let owner_id: i32 = parse_arg(&args, 3, "owner_id")?;
            let n = scheduler.cancel_jobs(job_type, owner_id).await?;
            println!("cancelled {n} pending job(s)");
        }
        "show" => {
            let id: i64 = parse_arg(&args, 2, "job_id")?;
            match store.get_by_id(id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => {
                    eprintln!("job {id} not found");
                    std::process::exit(1);
                }
            }
        }
        "list" => {
            let limit: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
            print_jobs(&store.list_recent(limit).await?);
        }
        "owner" => {
            let owner_id: i32 = parse_arg(&args, 2, "owner_id")?;
            let job_type = args.get(3).map(String::as_str).filter(|s| *s != "-");
            let limit: i64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(20);
            print_jobs(&store.list_for_owner(job_type, owner_id, limit).await?);
        }
        "counts" => {
            let c = store.counts().await?;
            println!(
                "worker_jobs: pending={} running={} succeeded={} failed={}",
                c.pending, c.running, c.succeeded, c.failed
            );
        }
        "cleanup" => {
            let n = scheduler.remove_old_jobs(&[]).await?;
            println!("removed {n} expired job(s)");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing <{name}>\n\n{USAGE}"))
}

fn parse_arg<T>(args: &[String], idx: usize, name: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(arg(args, idx, name)?.parse()?)
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE TABLE worker_jobs RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;

    println!("reset OK");
    Ok(())
}

fn print_jobs(jobs: &[WorkerJob]) {
    if jobs.is_empty() {
        println!("(no jobs)");
        return;
    }
    for job in jobs {
        let state = match (job.started, job.finished, job.success) {
            (_, Some(_), Some(true)) => "succeeded",
            (_, Some(_), _) => "failed",
            (Some(_), None, _) => "running",
            (None, None, _) => "pending",
        };
        let error = job
            .result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("");
        println!(
            "{:>8} {:<24} owner={:<6} {:<9} due={} cron={} {}",
            job.id,
            job.job_type,
            job.owner_id,
            state,
            job.due.format("%Y-%m-%d %H:%M:%S"),
            job.cron_schedule.as_deref().unwrap_or("-"),
            error
        );
    }
}

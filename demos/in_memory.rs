use std::time::Duration;

use tardy::{JobData, JobResult, MemoryBackend, NewJob, WorkerBuilder, WorkerContext};

#[derive(Debug, Clone)]
enum Task {
    Greet(String),
    Flaky(u32),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let backend = MemoryBackend::<Task>::new();
    backend.enqueue(Task::Greet("world".to_owned()));
    backend.enqueue(NewJob::new(Task::Flaky(1)).name("Flaky").max_attempts(2));
    backend.enqueue(NewJob::new(Task::Greet("later".to_owned())).delay(Duration::from_secs(1)));

    let workers = (0..2).map(|n| {
        WorkerBuilder::new()
            .name(format!("demo-{n}"))
            .sleep_delay(Duration::from_millis(250))
            .backoff(tardy::Backoff::Immediate)
            .handler(job_handler)
            .context(n)
            .build(backend.clone())
            .with_graceful_shutdown(async {
                tokio::time::sleep(Duration::from_secs(3)).await;
            })
            .run()
    });

    let mut tasks = tokio::task::JoinSet::new();
    for worker in workers {
        tasks.spawn(worker);
    }
    for result in tasks.join_all().await {
        if let Err(error) = result {
            tracing::error!(error = %error, "Worker failed");
        }
    }

    for job in backend.failed() {
        tracing::warn!(job = %job.name, error = ?job.last_error, "Job failed for good");
    }
}

async fn job_handler(JobData(task): JobData<Task>, WorkerContext(worker): WorkerContext<usize>) -> JobResult {
    match task {
        Task::Greet(name) => {
            tracing::info!("worker {worker}: hello, {name}");
            Ok(())
        }
        Task::Flaky(code) => Err(format!("flaky task exited with {code}").into()),
    }
}

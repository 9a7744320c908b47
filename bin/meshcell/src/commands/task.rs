use meshcell_client::TaskPublisher;
use meshcell_core::{Task, TaskResult};
use std::path::PathBuf;
use std::time::Duration;

pub struct PublishArgs {
    pub task_type: String,
    pub payload: String,
    pub id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub expect: usize,
    pub wait_ms: u64,
}

impl PublishArgs {
    fn task(&self) -> Task {
        let mut task = Task::new(&self.task_type, super::parse_value(&self.payload));
        if let Some(id) = &self.id {
            task = task.with_id(id);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            task = task.with_timeout_ms(timeout_ms);
        }
        task
    }
}

pub async fn publish(config: Option<PathBuf>, args: PublishArgs) -> anyhow::Result<()> {
    let task = args.task();
    task.validate()?;

    let config = super::load_config(config)?;
    let bus = super::connect(&config).await?;
    let publisher = TaskPublisher::new(bus.clone());

    if args.wait_ms == 0 {
        publisher.publish(&task).await?;
        bus.flush().await?;
        println!("Published task {} to tasks.{}", task.id, task.task_type);
        return Ok(());
    }

    println!("Published task {} to tasks.{}", task.id, task.task_type);
    let results = publisher
        .dispatch(&task, args.expect, Duration::from_millis(args.wait_ms))
        .await?;

    for result in &results {
        print_result(result);
    }
    let failed = results.iter().filter(|r| !r.is_success()).count();
    println!();
    println!("{} results ({} failed)", results.len(), failed);

    if args.expect > 0 && results.len() < args.expect {
        anyhow::bail!("expected {} results, got {}", args.expect, results.len());
    }
    Ok(())
}

fn print_result(result: &TaskResult) {
    if result.is_success() {
        println!(
            "✓ {} ({} ms): {}",
            result.agent_id, result.processing_time_ms, result.payload
        );
    } else {
        println!(
            "✗ {} ({} ms): {}",
            result.agent_id,
            result.processing_time_ms,
            result.error.as_deref().unwrap_or("failed")
        );
    }
}

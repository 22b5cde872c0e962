//! Worker-process side of the process pool protocol

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};

use pipeinfer_core::config::WORKER_ENV_VAR;
use pipeinfer_core::{ErrorPolicy, Item, Result, Transform};

use super::protocol::{decode, encode, read_frame, write_frame, Request, Response};

/// Transforms a worker process can run, looked up by name.
///
/// Closures cannot cross a process boundary, so the parent sends the
/// transform's name and the worker binary registers a transform under
/// the same name.
pub struct TaskRegistry<T> {
    tasks: HashMap<String, Transform<T>>,
}

impl<T: Item> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> TaskRegistry<T> {
    /// Empty registry
    pub fn new() -> Self {
        Self { tasks: HashMap::new() }
    }

    /// Register a transform under its own name
    pub fn with(mut self, transform: Transform<T>) -> Self {
        self.register(transform);
        self
    }

    /// Register a transform under its own name, replacing any previous one
    pub fn register(&mut self, transform: Transform<T>) {
        self.tasks.insert(transform.name().to_string(), transform);
    }

    /// Transform registered as `name`
    pub fn get(&self, name: &str) -> Option<&Transform<T>> {
        self.tasks.get(name)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn handle(&self, request: Request<T>) -> Response<T> {
        let Some(transform) = self.get(&request.task) else {
            return Response::Rejected {
                message: format!("unknown task '{}'", request.task),
            };
        };
        let policy = ErrorPolicy::retry(request.max_attempts.saturating_sub(1));
        let outcomes = request
            .items
            .iter()
            .zip(request.start_index..)
            .map(|(item, index)| transform.run(index, item, &policy))
            .collect();
        Response::Done { outcomes }
    }
}

/// Answer requests from `reader` on `writer` until end of stream
pub fn serve<T: Item>(
    registry: &TaskRegistry<T>,
    reader: impl Read,
    writer: impl Write,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut served = 0_u64;

    while let Some(frame) = read_frame(&mut reader)? {
        let request: Request<T> = decode(&frame)?;
        tracing::trace!(task = %request.task, items = request.items.len(), "batch received");
        let response = registry.handle(request);
        write_frame(&mut writer, &encode(&response)?)?;
        served += 1;
    }
    tracing::debug!(served, "input closed, worker exiting");
    Ok(())
}

/// Serve the parent process over stdin and stdout
pub fn run_worker<T: Item>(registry: &TaskRegistry<T>) -> Result<()> {
    serve(registry, io::stdin().lock(), io::stdout().lock())
}

/// Whether this process was launched as a pool worker
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV_VAR).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeinfer_core::Yielded;
    use std::io::Cursor;

    fn registry() -> TaskRegistry<i64> {
        TaskRegistry::new()
            .with(Transform::map("double", |x: &i64| Ok(x * 2)))
            .with(Transform::map("odd_fails", |x: &i64| {
                anyhow::ensure!(x % 2 == 0, "odd input {x}");
                Ok(*x)
            }))
    }

    fn exchange(registry: &TaskRegistry<i64>, requests: &[Request<i64>]) -> Vec<Response<i64>> {
        let mut input = Vec::new();
        for request in requests {
            write_frame(&mut input, &encode(request).unwrap()).unwrap();
        }
        let mut output = Vec::new();
        serve(registry, Cursor::new(input), &mut output).unwrap();

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(frame) = read_frame(&mut reader).unwrap() {
            responses.push(decode(&frame).unwrap());
        }
        responses
    }

    #[test]
    fn test_serve_runs_registered_task() {
        let responses = exchange(
            &registry(),
            &[Request {
                task: "double".into(),
                start_index: 0,
                max_attempts: 1,
                items: vec![1, 2, 3],
            }],
        );
        assert_eq!(
            responses,
            vec![Response::Done {
                outcomes: vec![Yielded::Value(2), Yielded::Value(4), Yielded::Value(6)],
            }]
        );
    }

    #[test]
    fn test_serve_reports_global_indices() {
        let responses = exchange(
            &registry(),
            &[Request {
                task: "odd_fails".into(),
                start_index: 40,
                max_attempts: 3,
                items: vec![2, 3],
            }],
        );
        let Response::Done { outcomes } = &responses[0] else {
            panic!("expected outcomes");
        };
        match &outcomes[1] {
            Yielded::Failed(failure) => {
                assert_eq!(failure.index, 41);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_serve_rejects_unknown_task() {
        let responses = exchange(
            &registry(),
            &[Request {
                task: "missing".into(),
                start_index: 0,
                max_attempts: 1,
                items: vec![1],
            }],
        );
        assert!(matches!(
            &responses[0],
            Response::Rejected { message } if message.contains("missing")
        ));
    }
}

//! Pipelined execution as tasks on a tokio runtime

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use pipeinfer_core::{CancellationToken, Error, Item, OperatorRun, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Semaphore;

use super::{settle, Collected, Deadline, EdgeMessage, Inbox, NodeOutcome, Plan, RunEnv};

/// Run every node as a task, streaming over bounded edges.
///
/// The scheduler owns its runtime, so it must be called from outside any
/// tokio runtime. Operator work runs on the blocking pool; node tasks only
/// move items between edges, so a few runtime threads are enough.
pub(super) fn run<T: Item>(plan: Plan<'_, T>, env: &RunEnv) -> Result<Vec<NodeOutcome<T>>> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::setup(
            "the async scheduler cannot start inside a tokio runtime; use the threaded scheduler",
        ));
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(env.config.max_concurrent_nodes)
        .thread_name("pipeinfer-scheduler")
        .enable_time()
        .build()
        .map_err(|e| Error::resource(format!("failed to start scheduler runtime: {e}")))?;

    let dag = plan.dag;
    let nodes = dag.len();
    let mut inputs: Vec<Vec<mpsc::Receiver<EdgeMessage<T>>>> =
        (0..nodes).map(|_| Vec::new()).collect();
    let mut outputs: Vec<Vec<mpsc::Sender<EdgeMessage<T>>>> =
        (0..nodes).map(|_| Vec::new()).collect();
    for to in 0..nodes {
        for &from in dag.upstream(to) {
            let (tx, rx) = mpsc::channel(env.config.edge_capacity);
            outputs[from].push(tx);
            inputs[to].push(rx);
        }
    }

    let limits = Limits {
        cancel: env.cancel.clone(),
        timeout: env.config.node_timeout(),
        micro_batch: env.config.micro_batch,
        edge_capacity: env.config.edge_capacity,
    };
    let permits = Arc::new(Semaphore::new(env.config.max_concurrent_nodes));
    let mut outcomes: Vec<Option<NodeOutcome<T>>> = (0..nodes).map(|_| None).collect();
    let mut tasks = Vec::with_capacity(nodes);

    // Runs are opened here because tasks must own everything they touch.
    for &node in &plan.order {
        let op = &plan.operators[node];
        let started_after = env.started.elapsed();
        let edges = std::mem::take(&mut outputs[node]);
        match op.begin(env.context(op)) {
            Ok(run) => tasks.push((
                node,
                NodeTask {
                    name: op.name().to_string(),
                    run: Some(run),
                    inputs: std::mem::take(&mut inputs[node]),
                    outbox: Outbox {
                        edges: edges.into_iter().map(Some).collect(),
                    },
                    initial: if dag.upstream(node).is_empty() {
                        plan.initial_input()
                    } else {
                        Vec::new()
                    },
                    permits: Arc::clone(&permits),
                    limits: limits.clone(),
                    collected: Collected::new(env.retains(dag, node)),
                    started_after,
                },
            )),
            Err(err) => {
                for tx in &edges {
                    let _ = tx.try_send(EdgeMessage::Failed(op.name().to_string()));
                }
                outcomes[node] = Some(NodeOutcome::unstarted(err, started_after));
            }
        }
    }

    runtime.block_on(async {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|(node, task)| (node, tokio::spawn(task.run())))
            .collect();
        for (node, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|err| {
                let err =
                    Error::resource(format!("task of node `{}` failed: {err}", dag.name(node)));
                NodeOutcome::unstarted(err, env.started.elapsed())
            });
            outcomes[node] = Some(outcome);
        }
    });

    Ok(outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| {
                let err = Error::setup("node was not scheduled");
                NodeOutcome::unstarted(err, env.started.elapsed())
            })
        })
        .collect())
}

#[derive(Clone)]
struct Limits {
    cancel: CancellationToken,
    timeout: Option<Duration>,
    micro_batch: usize,
    edge_capacity: usize,
}

struct Outbox<T> {
    edges: Vec<Option<mpsc::Sender<EdgeMessage<T>>>>,
}

impl<T: Item> Outbox<T> {
    async fn send_all(&mut self, items: Vec<T>, limits: &Limits) -> Result<()> {
        for item in items {
            self.send(EdgeMessage::Item(item), limits).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: EdgeMessage<T>, limits: &Limits) -> Result<()> {
        for slot in &mut self.edges {
            let Some(tx) = slot else {
                continue;
            };
            let deadline = Deadline::new(limits.timeout);
            let delivered = loop {
                let slice = deadline.next_slice("downstream edge", &limits.cancel)?;
                // Reserving first keeps the message if the wait times out.
                match tokio::time::timeout(slice, tx.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(message.clone());
                        break true;
                    }
                    Ok(Err(_)) => break false,
                    Err(_) => continue,
                }
            };
            if !delivered {
                *slot = None;
            }
        }
        Ok(())
    }

    async fn fail(&mut self, operator: &str, limits: &Limits) {
        if let Err(err) = self.send(EdgeMessage::Failed(operator.to_string()), limits).await {
            tracing::warn!(operator, error = %err, "could not forward failure downstream");
        }
    }
}

struct NodeTask<T: Item> {
    name: String,
    run: Option<OperatorRun<T>>,
    inputs: Vec<mpsc::Receiver<EdgeMessage<T>>>,
    outbox: Outbox<T>,
    initial: Vec<T>,
    permits: Arc<Semaphore>,
    limits: Limits,
    collected: Collected<T>,
    started_after: Duration,
}

impl<T: Item> NodeTask<T> {
    async fn run(mut self) -> NodeOutcome<T> {
        let is_source = self.run.as_ref().is_some_and(OperatorRun::is_source);
        let result = if is_source {
            self.drive_source().await
        } else if self.inputs.is_empty() {
            self.drive_initial().await
        } else {
            self.drive_edges().await
        };
        if let Err(err) = &result {
            if !matches!(err, Error::Cancelled) {
                self.outbox.fail(&self.name, &self.limits).await;
            }
        }

        let NodeTask {
            run,
            outbox,
            inputs,
            limits,
            collected,
            started_after,
            ..
        } = self;
        drop(outbox);
        drop(inputs);
        match run {
            Some(run) => settle(run, result, collected, started_after, &limits.cancel),
            None => NodeOutcome::unstarted(
                result.err().unwrap_or_else(|| Error::resource("operator run was lost")),
                started_after,
            ),
        }
    }

    /// Run blocking operator work on the blocking pool, holding a node permit
    async fn blocking<R, F>(&mut self, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut OperatorRun<T>) -> Result<R> + Send + 'static,
    {
        let deadline = Deadline::new(self.limits.timeout);
        let _permit = loop {
            let slice = deadline.next_slice("node permit", &self.limits.cancel)?;
            let acquire = Arc::clone(&self.permits).acquire_owned();
            if let Ok(permit) = tokio::time::timeout(slice, acquire).await {
                break permit.map_err(|_| Error::resource("node semaphore closed"))?;
            }
        };
        let Some(mut run) = self.run.take() else {
            return Err(Error::resource("operator run was lost"));
        };
        let joined = tokio::task::spawn_blocking(move || {
            let result = work(&mut run);
            (run, result)
        })
        .await;
        match joined {
            Ok((run, result)) => {
                self.run = Some(run);
                result
            }
            Err(err) => Err(Error::resource(format!(
                "operator `{}` stopped abnormally: {err}",
                self.name
            ))),
        }
    }

    async fn drive_source(&mut self) -> Result<()> {
        let max = self.limits.micro_batch;
        loop {
            let Some(chunk) = self.blocking(move |run| run.pull_source(max)).await? else {
                return Ok(());
            };
            self.collected.record(&chunk);
            self.outbox.send_all(chunk, &self.limits).await?;
        }
    }

    async fn drive_initial(&mut self) -> Result<()> {
        let mut input = std::mem::take(&mut self.initial).into_iter();
        loop {
            let chunk: Vec<T> = input.by_ref().take(self.limits.micro_batch).collect();
            if chunk.is_empty() {
                return Ok(());
            }
            self.process(chunk).await?;
        }
    }

    async fn drive_edges(&mut self) -> Result<()> {
        let mut inbox = Inbox::new(self.inputs.len(), self.limits.edge_capacity);
        loop {
            self.fill(&mut inbox).await?;
            if inbox.is_drained() {
                return Ok(());
            }
            let (chunk, failed) = inbox.take_chunk(self.limits.micro_batch);
            if !chunk.is_empty() {
                self.process(chunk).await?;
            }
            if let Some(upstream) = failed {
                return Err(Error::UpstreamFailed(upstream));
            }
        }
    }

    async fn process(&mut self, chunk: Vec<T>) -> Result<()> {
        let out = self.blocking(move |run| run.process_chunk(chunk)).await?;
        self.collected.record(&out);
        self.outbox.send_all(out, &self.limits).await
    }

    /// Receive until the inbox is ready
    async fn fill(&mut self, inbox: &mut Inbox<T>) -> Result<()> {
        loop {
            for (edge, rx) in self.inputs.iter_mut().enumerate() {
                while inbox.wants(edge) {
                    match rx.try_recv() {
                        Ok(message) => inbox.push(edge, message),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => inbox.close(edge),
                    }
                }
            }
            if inbox.is_ready() {
                return Ok(());
            }

            let wanted = inbox.wanted();
            let deadline = Deadline::new(self.limits.timeout);
            let (edge, message) = loop {
                let slice = deadline.next_slice("upstream edge", &self.limits.cancel)?;
                let receives = self
                    .inputs
                    .iter_mut()
                    .enumerate()
                    .filter(|(edge, _)| wanted.contains(edge))
                    .map(|(edge, rx)| Box::pin(async move { (edge, rx.recv().await) }));
                let received = tokio::time::timeout(slice, select_all(receives)).await;
                if let Ok(((edge, message), _, _)) = received {
                    break (edge, message);
                }
            };
            match message {
                Some(message) => inbox.push(edge, message),
                None => inbox.close(edge),
            }
        }
    }
}

//! Pipelined execution with one OS thread per node

use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Select, SendTimeoutError, Sender, TryRecvError};
use pipeinfer_core::{CancellationToken, Error, Item, OperatorRun, Result};

use super::{settle, Collected, Deadline, EdgeMessage, Inbox, NodeOutcome, Plan, RunEnv};

/// Run every node on its own scoped thread, streaming over bounded edges.
///
/// This backend needs nothing but OS threads. Its observable behavior
/// matches the async scheduler.
pub(super) fn run<T: Item>(plan: Plan<'_, T>, env: &RunEnv) -> Result<Vec<NodeOutcome<T>>> {
    let dag = plan.dag;
    let nodes = dag.len();
    let mut inputs: Vec<Vec<Receiver<EdgeMessage<T>>>> = (0..nodes).map(|_| Vec::new()).collect();
    let mut outputs: Vec<Vec<Sender<EdgeMessage<T>>>> = (0..nodes).map(|_| Vec::new()).collect();
    for to in 0..nodes {
        for &from in dag.upstream(to) {
            let (tx, rx) = channel::bounded(env.config.edge_capacity);
            outputs[from].push(tx);
            inputs[to].push(rx);
        }
    }

    let permits = Permits::new(env.config.max_concurrent_nodes);
    let plan = &plan;
    let permits = &permits;
    let mut outcomes: Vec<Option<NodeOutcome<T>>> = (0..nodes).map(|_| None).collect();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(nodes);
        for &node in &plan.order {
            let name = dag.name(node);
            let node_inputs = std::mem::take(&mut inputs[node]);
            let node_outputs = std::mem::take(&mut outputs[node]);
            let failover = node_outputs.clone();
            let task = NodeTask {
                node,
                plan,
                env,
                permits,
            };
            let spawned = thread::Builder::new()
                .name(format!("pipeinfer-node-{name}"))
                .spawn_scoped(scope, move || task.run(node_inputs, node_outputs));
            match spawned {
                Ok(handle) => handles.push((node, handle)),
                Err(err) => {
                    for tx in &failover {
                        let _ = tx.try_send(EdgeMessage::Failed(name.to_string()));
                    }
                    let err = Error::resource(format!(
                        "failed to spawn thread for node `{name}`: {err}"
                    ));
                    outcomes[node] = Some(NodeOutcome::unstarted(err, env.started.elapsed()));
                }
            }
        }
        for (node, handle) in handles {
            let outcome = handle.join().unwrap_or_else(|_| {
                let err = Error::resource(format!("thread of node `{}` panicked", dag.name(node)));
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

/// Waits in short slices so cancellation is noticed
#[derive(Clone, Copy)]
struct Waiter<'a> {
    cancel: &'a CancellationToken,
    timeout: Option<Duration>,
}

impl Waiter<'_> {
    /// Call `attempt` with successive time slices until it produces a value
    fn wait<R>(&self, point: &str, mut attempt: impl FnMut(Duration) -> Option<R>) -> Result<R> {
        let deadline = Deadline::new(self.timeout);
        loop {
            let slice = deadline.next_slice(point, self.cancel)?;
            if let Some(value) = attempt(slice) {
                return Ok(value);
            }
        }
    }
}

/// Counting semaphore over a bounded channel
struct Permits {
    slots: Sender<()>,
    taken: Receiver<()>,
}

impl Permits {
    fn new(limit: usize) -> Self {
        let (slots, taken) = channel::bounded(limit.max(1));
        Self { slots, taken }
    }

    fn acquire(&self, waiter: Waiter<'_>) -> Result<Permit<'_>> {
        waiter.wait("node permit", |slice| self.slots.send_timeout((), slice).ok())?;
        Ok(Permit { taken: &self.taken })
    }
}

struct Permit<'a> {
    taken: &'a Receiver<()>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.taken.try_recv();
    }
}

/// Fan-out to every live downstream edge
struct Outbox<'a, T> {
    edges: Vec<Option<Sender<EdgeMessage<T>>>>,
    waiter: Waiter<'a>,
}

impl<T: Item> Outbox<'_, T> {
    fn send_all(&mut self, items: Vec<T>) -> Result<()> {
        for item in items {
            self.send(EdgeMessage::Item(item))?;
        }
        Ok(())
    }

    fn send(&mut self, message: EdgeMessage<T>) -> Result<()> {
        for slot in &mut self.edges {
            let Some(tx) = slot else {
                continue;
            };
            let mut pending = Some(message.clone());
            let delivered = self.waiter.wait("downstream edge", |slice| {
                let message = pending.take()?;
                match tx.send_timeout(message, slice) {
                    Ok(()) => Some(true),
                    Err(SendTimeoutError::Timeout(message)) => {
                        pending = Some(message);
                        None
                    }
                    Err(SendTimeoutError::Disconnected(_)) => Some(false),
                }
            })?;
            if !delivered {
                // The consumer stopped; it no longer needs our output.
                *slot = None;
            }
        }
        Ok(())
    }

    fn fail(&mut self, operator: &str) {
        if let Err(err) = self.send(EdgeMessage::Failed(operator.to_string())) {
            tracing::warn!(operator, error = %err, "could not forward failure downstream");
        }
    }
}

struct NodeTask<'a, T: Item> {
    node: usize,
    plan: &'a Plan<'a, T>,
    env: &'a RunEnv,
    permits: &'a Permits,
}

impl<'a, T: Item> NodeTask<'a, T> {
    fn waiter(&self) -> Waiter<'a> {
        Waiter {
            cancel: &self.env.cancel,
            timeout: self.env.config.node_timeout(),
        }
    }

    fn run(
        self,
        inputs: Vec<Receiver<EdgeMessage<T>>>,
        outputs: Vec<Sender<EdgeMessage<T>>>,
    ) -> NodeOutcome<T> {
        let op = &self.plan.operators[self.node];
        let started_after = self.env.started.elapsed();
        let mut outbox = Outbox {
            edges: outputs.into_iter().map(Some).collect(),
            waiter: self.waiter(),
        };
        let mut run = match op.begin(self.env.context(op)) {
            Ok(run) => run,
            Err(err) => {
                outbox.fail(op.name());
                return NodeOutcome::unstarted(err, started_after);
            }
        };

        let mut collected = Collected::new(self.env.retains(self.plan.dag, self.node));
        let result = if run.is_source() {
            self.drive_source(&mut run, &mut outbox, &mut collected)
        } else if inputs.is_empty() {
            self.drive_initial(&mut run, &mut outbox, &mut collected)
        } else {
            self.drive_edges(&mut run, &inputs, &mut outbox, &mut collected)
        };
        if let Err(err) = &result {
            if !matches!(err, Error::Cancelled) {
                outbox.fail(op.name());
            }
        }
        drop(outbox);
        settle(run, result, collected, started_after, &self.env.cancel)
    }

    fn drive_source(
        &self,
        run: &mut OperatorRun<T>,
        outbox: &mut Outbox<'_, T>,
        collected: &mut Collected<T>,
    ) -> Result<()> {
        loop {
            let chunk = {
                let _permit = self.permits.acquire(self.waiter())?;
                run.pull_source(self.env.config.micro_batch)?
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            collected.record(&chunk);
            outbox.send_all(chunk)?;
        }
    }

    fn drive_initial(
        &self,
        run: &mut OperatorRun<T>,
        outbox: &mut Outbox<'_, T>,
        collected: &mut Collected<T>,
    ) -> Result<()> {
        let mut input = self.plan.initial_input().into_iter();
        loop {
            let chunk: Vec<T> = input.by_ref().take(self.env.config.micro_batch).collect();
            if chunk.is_empty() {
                return Ok(());
            }
            let out = {
                let _permit = self.permits.acquire(self.waiter())?;
                run.process_chunk(chunk)?
            };
            collected.record(&out);
            outbox.send_all(out)?;
        }
    }

    fn drive_edges(
        &self,
        run: &mut OperatorRun<T>,
        inputs: &[Receiver<EdgeMessage<T>>],
        outbox: &mut Outbox<'_, T>,
        collected: &mut Collected<T>,
    ) -> Result<()> {
        let mut inbox = Inbox::new(inputs.len(), self.env.config.edge_capacity);
        loop {
            self.fill(inputs, &mut inbox)?;
            if inbox.is_drained() {
                return Ok(());
            }
            let (chunk, failed) = inbox.take_chunk(self.env.config.micro_batch);
            if !chunk.is_empty() {
                let out = {
                    let _permit = self.permits.acquire(self.waiter())?;
                    run.process_chunk(chunk)?
                };
                collected.record(&out);
                outbox.send_all(out)?;
            }
            if let Some(upstream) = failed {
                return Err(Error::UpstreamFailed(upstream));
            }
        }
    }

    /// Receive until the inbox is ready
    fn fill(&self, inputs: &[Receiver<EdgeMessage<T>>], inbox: &mut Inbox<T>) -> Result<()> {
        loop {
            for (edge, rx) in inputs.iter().enumerate() {
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
            let (edge, message) = self.waiter().wait("upstream edge", |slice| {
                let mut select = Select::new();
                for &edge in &wanted {
                    select.recv(&inputs[edge]);
                }
                let op = select.select_timeout(slice).ok()?;
                let edge = wanted[op.index()];
                Some((edge, op.recv(&inputs[edge]).ok()))
            })?;
            match message {
                Some(message) => inbox.push(edge, message),
                None => inbox.close(edge),
            }
        }
    }
}

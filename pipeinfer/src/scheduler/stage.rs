//! Stage-sequential execution

use pipeinfer_core::{Error, Item, NodeOutput, NodeStatus, PipelineOperator, RunSummary};

use super::{status_of, NodeOutcome, Plan, RunEnv};

/// Run nodes one at a time in topological order.
///
/// Each node drains the concatenated output of its upstreams, in edge
/// order. A node whose upstream did not complete is skipped.
pub(super) fn run<T: Item>(plan: Plan<'_, T>, env: &RunEnv) -> Vec<NodeOutcome<T>> {
    let dag = plan.dag;
    let nodes = dag.len();
    let mut produced: Vec<Vec<T>> = (0..nodes).map(|_| Vec::new()).collect();
    let mut consumers_left: Vec<usize> = (0..nodes).map(|id| dag.downstream(id).len()).collect();
    let mut outcomes: Vec<Option<NodeOutcome<T>>> = (0..nodes).map(|_| None).collect();

    for &node in &plan.order {
        let started_after = env.started.elapsed();
        let upstream = dag.upstream(node);

        let blocked = upstream.iter().copied().find(|&up| {
            outcomes[up]
                .as_ref()
                .map_or(true, |outcome| outcome.status != NodeStatus::Completed)
        });
        if let Some(up) = blocked {
            let err = Error::UpstreamFailed(dag.name(up).to_string());
            tracing::warn!(operator = dag.name(node), upstream = dag.name(up), "skipping node");
            outcomes[node] = Some(NodeOutcome::unstarted(err, started_after));
            continue;
        }
        if env.cancel.is_cancelled() {
            outcomes[node] = Some(NodeOutcome::unstarted(Error::Cancelled, started_after));
            continue;
        }

        let input = if upstream.is_empty() {
            plan.initial_input()
        } else {
            let mut input = Vec::new();
            for &up in upstream {
                consumers_left[up] -= 1;
                if consumers_left[up] == 0 && !env.retains(dag, up) {
                    input.append(&mut produced[up]);
                } else {
                    input.extend_from_slice(&produced[up]);
                }
            }
            input
        };

        let (result, summary) = drain(&plan.operators[node], input, env);
        let (status, error, items) = match result {
            Ok(items) => (NodeStatus::Completed, None, items),
            Err((err, partial)) => (status_of(&err), Some(err), partial),
        };
        let count = items.len() as u64;
        produced[node] = items;
        outcomes[node] = Some(NodeOutcome {
            status,
            output: NodeOutput::Count(count),
            summary,
            started_after,
            error,
        });
    }

    outcomes
        .into_iter()
        .enumerate()
        .map(|(node, outcome)| {
            let mut outcome = outcome.unwrap_or_else(|| {
                let err = Error::setup("node was not scheduled");
                NodeOutcome::unstarted(err, env.started.elapsed())
            });
            if env.retains(dag, node) {
                outcome.output = NodeOutput::Items(std::mem::take(&mut produced[node]));
            }
            outcome
        })
        .collect()
}

type Drained<T> = std::result::Result<Vec<T>, (Error, Vec<T>)>;

/// Pull an operator's whole output, keeping what came before a failure
fn drain<T: Item>(
    op: &PipelineOperator<T>,
    input: Vec<T>,
    env: &RunEnv,
) -> (Drained<T>, RunSummary) {
    let total = input.len() as u64;
    let mut stream = match op.process(Box::new(input.into_iter()), env.context(op)) {
        Ok(stream) => stream,
        Err(err) => return (Err((err, Vec::new())), RunSummary::default()),
    };
    if !op.is_source() {
        stream.set_total_estimate(Some(total));
    }

    let mut items = Vec::new();
    let mut failure = None;
    for result in stream.by_ref() {
        match result {
            Ok(item) => items.push(item),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    let summary = stream.summary();
    match failure {
        None => (Ok(items), summary),
        Some(err) => (Err((err, items)), summary),
    }
}

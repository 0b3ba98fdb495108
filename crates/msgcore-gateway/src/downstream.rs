//! This instance's downstream consumer, spec §4.1 "Downstream consumer" /
//! §4.2 step 6 (fan-out emit). One task per partition of
//! `downstream-{instance_id}`, each independently draining and dispatching
//! to local connections — generalizes `msgcore-logic`'s and
//! `msgcore-task`'s "one consumer per partition" worker shape to the
//! gateway side of the bus.

use std::sync::Arc;

use msgcore_bus::{Consumer, Topic};
use msgcore_protocol::envelopes::DownstreamEnvelope;
use tracing::{debug, warn};

use crate::{session::deliver_downstream, state::GatewayState};

/// Spawns one task per partition of `state`'s own downstream topic. Returns
/// immediately; the tasks run for the lifetime of the process (or until the
/// topic is dropped, which only happens at shutdown).
pub fn spawn_consumers(state: Arc<GatewayState>) {
    let topic = state.own_downstream_topic();
    let partitions = topic.partitions();

    for partition in 0..partitions {
        let mut consumer = match topic.take_partition(partition) {
            Ok(consumer) => consumer,
            Err(err) => {
                warn!(error = %err, partition, "downstream partition already claimed, skipping");
                continue;
            },
        };
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            loop {
                let Some((_key, payload)) = consumer.recv().await else {
                    debug!(partition, instance_id = %state.instance_id, "downstream topic closed, consumer exiting");
                    return;
                };

                match serde_json::from_slice::<DownstreamEnvelope>(&payload) {
                    Ok(envelope) => deliver_downstream(&state, envelope).await,
                    Err(err) => warn!(error = %err, partition, "dropping malformed downstream envelope"),
                }
            }
        });
    }
}

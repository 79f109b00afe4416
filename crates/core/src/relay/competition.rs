/// Competitive connect
///
/// Sends the same connect to the top few candidates at once and keeps the
/// first node that answers with success. All waits are polled by one
/// collector, so exactly one winner is ever chosen; every other attempt is
/// abandoned and its stream closed on its node.

use super::engine::{ConnectRequest, EstablishedStream, RelayEngine};
use crate::network::ExitNode;
use futures_util::stream::{FuturesUnordered, StreamExt};
use relaymesh_common::{RelayMeshError, Result, StreamId};
use std::sync::Arc;
use tracing::{debug, info};

pub struct CompetitiveConnector<'a> {
    engine: &'a RelayEngine,
}

impl<'a> CompetitiveConnector<'a> {
    pub fn new(engine: &'a RelayEngine) -> Self {
        Self { engine }
    }

    pub async fn race(&self, request: &ConnectRequest) -> Result<EstablishedStream> {
        let settings = self.engine.settings();
        let racers = self
            .engine
            .selector()
            .select_racers(&request.criteria(), settings.race_width)
            .await;
        if racers.is_empty() {
            return Err(RelayMeshError::NoExitNode);
        }

        let mut contenders: Vec<(Arc<ExitNode>, StreamId)> = Vec::with_capacity(racers.len());
        let mut waits = FuturesUnordered::new();
        let mut last_error = None;

        for node in &racers {
            match self.engine.open(node, request).await {
                Ok(pending) => {
                    contenders.push((node.clone(), pending.id));
                    waits.push(self.engine.await_response(pending, settings.connect_timeout));
                }
                Err(e) => {
                    debug!("Race entry on {} failed to open: {}", node.id(), e);
                    last_error = Some(e);
                }
            }
        }

        let mut winner = None;
        while let Some(result) = waits.next().await {
            match result {
                Ok(established) => {
                    winner = Some(established);
                    break;
                }
                Err(e) => {
                    debug!("Race entry for {} lost: {}", request.target(), e);
                    last_error = Some(e);
                }
            }
        }
        drop(waits);

        let Some(winner) = winner else {
            return Err(last_error.unwrap_or(RelayMeshError::NoExitNode));
        };

        for (node, id) in &contenders {
            if *id != winner.id() {
                self.engine.abandon(node, *id).await;
            }
        }

        info!(
            "Race for {} won by {} among {} nodes",
            request.target(),
            winner.node().id(),
            contenders.len()
        );
        Ok(winner)
    }
}

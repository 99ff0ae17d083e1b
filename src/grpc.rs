//! gRPC transport surface (spec §4.6/§6): the `RaftKv` service defined in
//! `proto/raftkv.proto`, wired to a single partition's [`Cluster`].
//!
//! Mirrors the teacher's own gRPC service shape (one `tonic`-generated
//! `proto` module, one service struct wrapping the thing it fronts) but the
//! RPCs themselves are openraft's wire traffic plus the `Lookup`/`Update`
//! client surface instead of load-test coordination messages.

use std::sync::Arc;

use openraft::ServerState;
use tonic::{Request, Response as GrpcResponse, Status};

use crate::cluster::Cluster;
use crate::errors::ClusterError;
use crate::raft_types::TypeConfig;
use crate::types::{LookupRequest as KvLookupRequest, Response as KvResponse, UpdateRequest};

pub mod proto {
    tonic::include_proto!("raftkv");
}

use proto::raft_kv_server::{RaftKv, RaftKvServer};
use proto::{
    AppendEntriesRequest, AppendEntriesResponse, ClientRequest, ClientResponse, HealthRequest,
    HealthResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, Status> {
    serde_json::from_slice(payload).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(value).map_err(|e| Status::internal(e.to_string()))
}

/// Implements the `RaftKv` service for one locally-hosted partition. A node
/// that hosts several partitions runs one of these (behind separate ports or
/// a routing layer) per partition, same as `Cluster::start` is called once
/// per partition.
pub struct RaftKvService {
    cluster: Arc<Cluster>,
}

impl RaftKvService {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        RaftKvService { cluster }
    }

    pub fn into_server(self) -> RaftKvServer<Self> {
        RaftKvServer::new(self)
    }

    fn check_cluster_id(&self, cluster_id: u64) -> Result<(), Status> {
        if cluster_id != self.cluster.cluster_id() {
            return Err(Status::not_found(ClusterError::ClusterNotFound.to_string()));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl RaftKv for RaftKvService {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<GrpcResponse<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let rpc: openraft::raft::AppendEntriesRequest<TypeConfig> = decode(&req.payload)?;

        let resp = self
            .cluster
            .node_host()
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(GrpcResponse::new(AppendEntriesResponse {
            success: true,
            payload: encode(&resp)?,
        }))
    }

    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<GrpcResponse<VoteResponse>, Status> {
        let req = request.into_inner();
        let rpc: openraft::raft::VoteRequest<crate::raft_types::NodeId> = decode(&req.payload)?;

        let resp = self
            .cluster
            .node_host()
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(GrpcResponse::new(VoteResponse {
            vote_granted: resp.vote_granted,
            payload: encode(&resp)?,
        }))
    }

    async fn install_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<GrpcResponse<SnapshotResponse>, Status> {
        let req = request.into_inner();
        let rpc: openraft::raft::InstallSnapshotRequest<TypeConfig> = decode(&req.payload)?;

        let resp = self
            .cluster
            .node_host()
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(GrpcResponse::new(SnapshotResponse {
            payload: encode(&resp)?,
        }))
    }

    async fn lookup(
        &self,
        request: Request<ClientRequest>,
    ) -> Result<GrpcResponse<ClientResponse>, Status> {
        let req = request.into_inner();
        self.check_cluster_id(req.cluster_id)?;
        let lookup_request: KvLookupRequest = decode(&req.payload)?;

        crate::metrics::REQUESTS_TOTAL
            .with_label_values(&[
                &req.cluster_id.to_string(),
                &self.cluster.node_id().to_string(),
                "lookup",
                "attempt",
            ])
            .inc();

        let kv_response = match self.cluster.lookup(&lookup_request).await {
            Ok(items) => KvResponse::lookup_ok(items),
            Err(e) => KvResponse::failed(KvResponse::DECODE_FAILURE, e.to_string()),
        };

        Ok(GrpcResponse::new(ClientResponse {
            payload: encode(&kv_response)?,
        }))
    }

    async fn update(
        &self,
        request: Request<ClientRequest>,
    ) -> Result<GrpcResponse<ClientResponse>, Status> {
        let req = request.into_inner();
        self.check_cluster_id(req.cluster_id)?;
        let update_request: UpdateRequest = decode(&req.payload)?;

        crate::metrics::REQUESTS_TOTAL
            .with_label_values(&[
                &req.cluster_id.to_string(),
                &self.cluster.node_id().to_string(),
                "update",
                "attempt",
            ])
            .inc();

        let kv_response = match self.cluster.update(update_request).await {
            Ok(count) => KvResponse::update_ok(count),
            Err(e) => KvResponse::failed(KvResponse::DECODE_FAILURE, e.to_string()),
        };

        Ok(GrpcResponse::new(ClientResponse {
            payload: encode(&kv_response)?,
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<GrpcResponse<HealthResponse>, Status> {
        let metrics = self.cluster.node_host().metrics().borrow().clone();
        let peer_count = metrics
            .membership_config
            .membership()
            .voter_ids()
            .count() as u32;

        Ok(GrpcResponse::new(HealthResponse {
            node_id: self.cluster.node_id(),
            state: server_state_name(metrics.state).to_string(),
            cluster_ready: metrics.state != ServerState::Learner,
            peer_count,
        }))
    }
}

fn server_state_name(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "leader",
        ServerState::Follower => "follower",
        ServerState::Candidate => "candidate",
        ServerState::Learner => "learner",
        ServerState::Shutdown => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_state_names_are_lowercase() {
        assert_eq!(server_state_name(ServerState::Leader), "leader");
        assert_eq!(server_state_name(ServerState::Shutdown), "shutdown");
    }
}

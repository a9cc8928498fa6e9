//! gRPC surface of a node: the client key-value service, the cluster-facing
//! Raft and admin services, and the [`GrpcTransport`] peers use to reach
//! each other.

mod admin_service;
pub mod convert;
mod kv_service;
mod raft_service;
mod transport;

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use rkv_consensus::RaftHandle;
use rkv_proto::v1::{
    admin_service_server::AdminServiceServer, kv_service_server::KvServiceServer,
    raft_service_server::RaftServiceServer,
};
use rkv_txn::{FallbackKvDatabase, RetryPolicy};
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use admin_service::AdminServiceImpl;
pub use kv_service::KvServiceImpl;
pub use raft_service::RaftServiceImpl;
pub use transport::GrpcTransport;

/// Serve client transactions until `shutdown` resolves.
pub async fn serve_client(
    addr: SocketAddr,
    db: FallbackKvDatabase,
    retry: RetryPolicy,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(rkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(KvServiceServer::new(KvServiceImpl::new(db, retry)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}

/// Serve peer and operator traffic until `shutdown` resolves.
pub async fn serve_cluster(
    addr: SocketAddr,
    raft: RaftHandle,
    db: FallbackKvDatabase,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(rkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceImpl::new(raft)))
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(db)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}

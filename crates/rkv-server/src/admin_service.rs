use rkv_proto::v1::{
    admin_service_server::AdminService, AddMemberRequest, ClusterStatusRequest, ClusterStatusResponse,
    FallbackStatusRequest, FallbackStatusResponse, MembershipResponse, RemoveMemberRequest,
    SetReconcilePolicyRequest, StepDownRequest, StepDownResponse,
};
use rkv_txn::FallbackKvDatabase;
use rkv_types::ConfigChange;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::convert::{
    fallback_mode_to_proto, member_from_proto, members_to_proto, reconcile_from_proto, reconcile_to_proto,
    rkv_to_status, role_to_proto, unix_millis,
};

/// Operator surface: cluster status, membership and fallback policy.
pub struct AdminServiceImpl {
    db: FallbackKvDatabase,
}

impl AdminServiceImpl {
    pub fn new(db: FallbackKvDatabase) -> Self {
        AdminServiceImpl { db }
    }

    async fn change(&self, change: ConfigChange) -> Result<Response<MembershipResponse>, Status> {
        let raft = self.db.raft().raft();
        let result = raft.change_membership(change).await.map_err(rkv_to_status)?;
        let status = raft.status();
        Ok(Response::new(MembershipResponse { index: result.index, members: members_to_proto(&status.config) }))
    }

    fn fallback_report(&self) -> FallbackStatusResponse {
        let state = self.db.state();
        FallbackStatusResponse {
            mode: fallback_mode_to_proto(state.mode) as i32,
            last_switch_unix_ms: unix_millis(state.last_switch),
            migration_in_progress: state.migration_in_progress,
            reconcile: reconcile_to_proto(self.db.reconcile_policy()) as i32,
        }
    }
}

#[tonic::async_trait]
impl AdminService for AdminServiceImpl {
    async fn cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let status = self.db.raft().raft().status();
        Ok(Response::new(ClusterStatusResponse {
            node_id: status.id,
            role: role_to_proto(status.role) as i32,
            term: status.term,
            leader_id: status.leader.unwrap_or(0),
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            last_log_index: status.last_log_index,
            last_log_term: status.last_log_term,
            snapshot_index: status.snapshot_index,
            members: members_to_proto(&status.config),
        }))
    }

    async fn add_member(&self, request: Request<AddMemberRequest>) -> Result<Response<MembershipResponse>, Status> {
        let (id, addr) = member_from_proto(request.into_inner().member)?;
        info!(id, %addr, "adding member");
        self.change(ConfigChange::AddMember { id, addr }).await
    }

    async fn remove_member(
        &self,
        request: Request<RemoveMemberRequest>,
    ) -> Result<Response<MembershipResponse>, Status> {
        let id = request.into_inner().id;
        info!(id, "removing member");
        self.change(ConfigChange::RemoveMember { id }).await
    }

    async fn step_down(&self, _request: Request<StepDownRequest>) -> Result<Response<StepDownResponse>, Status> {
        self.db.raft().raft().step_down().await.map_err(rkv_to_status)?;
        Ok(Response::new(StepDownResponse {}))
    }

    async fn fallback_status(
        &self,
        _request: Request<FallbackStatusRequest>,
    ) -> Result<Response<FallbackStatusResponse>, Status> {
        Ok(Response::new(self.fallback_report()))
    }

    async fn set_reconcile_policy(
        &self,
        request: Request<SetReconcilePolicyRequest>,
    ) -> Result<Response<FallbackStatusResponse>, Status> {
        let policy = reconcile_from_proto(request.into_inner().policy)?;
        self.db.set_reconcile_policy(policy);
        Ok(Response::new(self.fallback_report()))
    }
}

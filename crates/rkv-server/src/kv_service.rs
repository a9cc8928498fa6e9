use rkv_proto::v1::{
    self as pb, kv_service_server::KvService, DeleteRangeRequest, DeleteRequest, GetRequest, GetResponse,
    PutRequest, ScanRequest, ScanResponse, TxnRequest, TxnResponse, WriteResponse,
};
use rkv_txn::{FallbackKvDatabase, KvTransaction, RetryPolicy, TxOptions};
use rkv_types::{CommitResult, Mutation, RkvError, StoreKind};
use tonic::{Request, Response, Status};

use crate::convert::{
    key_range_from_proto, mutation_from_proto, non_empty, rkv_to_status, store_kind_to_proto, tx_options,
};

/// Client key-value access through the fallback coordinator. Each call is one
/// transaction, replayed on conflict.
pub struct KvServiceImpl {
    db: FallbackKvDatabase,
    retry: RetryPolicy,
}

/// Where a transaction read from.
struct Observed {
    store: StoreKind,
    base_index: u64,
}

impl Observed {
    fn of(tx: &impl KvTransaction) -> Self {
        Observed { store: tx.kind(), base_index: tx.base_index() }
    }
}

struct TxnOutcome {
    succeeded: bool,
    gets: Vec<pb::GetResult>,
    observed: Observed,
}

impl KvServiceImpl {
    pub fn new(db: FallbackKvDatabase, retry: RetryPolicy) -> Self {
        KvServiceImpl { db, retry }
    }

    fn header(&self, observed: &Observed) -> pb::ResponseHeader {
        let status = self.db.raft().raft().status();
        pb::ResponseHeader {
            node_id: status.id,
            store: store_kind_to_proto(observed.store) as i32,
            base_index: observed.base_index,
            term: status.term,
            commit_index: status.commit_index,
        }
    }

    async fn write(&self, options: TxOptions, mutation: Mutation) -> Result<Response<WriteResponse>, Status> {
        let (observed, result): (Observed, CommitResult) = self
            .retry
            .run(&self.db, options, move |tx| {
                let mutation = mutation.clone();
                Box::pin(async move {
                    tx.write(mutation)?;
                    Ok(Observed::of(&*tx))
                })
            })
            .await
            .map_err(rkv_to_status)?;
        Ok(Response::new(WriteResponse { header: Some(self.header(&observed)), index: result.index }))
    }
}

#[tonic::async_trait]
impl KvService for KvServiceImpl {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let key = non_empty(req.key)?;
        let options = tx_options(req.options)?;
        let ((value, observed), _) = self
            .retry
            .run(&self.db, options, move |tx| {
                let key = key.clone();
                Box::pin(async move {
                    let value = tx.get(&key).await?;
                    Ok((value, Observed::of(&*tx)))
                })
            })
            .await
            .map_err(rkv_to_status)?;
        Ok(Response::new(GetResponse { header: Some(self.header(&observed)), value }))
    }

    async fn scan(&self, request: Request<ScanRequest>) -> Result<Response<ScanResponse>, Status> {
        let req = request.into_inner();
        let range = key_range_from_proto(req.range);
        let limit = if req.limit == 0 { usize::MAX } else { req.limit as usize };
        let options = tx_options(req.options)?;
        let ((rows, observed), _) = self
            .retry
            .run(&self.db, options, move |tx| {
                let range = range.clone();
                Box::pin(async move {
                    let rows = tx.scan(range, limit).await?;
                    Ok((rows, Observed::of(&*tx)))
                })
            })
            .await
            .map_err(rkv_to_status)?;
        let kvs = rows.into_iter().map(|(key, value)| pb::KeyValue { key, value }).collect();
        Ok(Response::new(ScanResponse { header: Some(self.header(&observed)), kvs }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let mutation = Mutation::Put { key: non_empty(req.key)?, value: req.value };
        self.write(tx_options(req.options)?, mutation).await
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let mutation = Mutation::Delete { key: non_empty(req.key)? };
        self.write(tx_options(req.options)?, mutation).await
    }

    async fn delete_range(&self, request: Request<DeleteRangeRequest>) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let mutation = Mutation::DeleteRange { range: key_range_from_proto(req.range) };
        self.write(tx_options(req.options)?, mutation).await
    }

    async fn txn(&self, request: Request<TxnRequest>) -> Result<Response<TxnResponse>, Status> {
        let req = request.into_inner();
        let options = tx_options(req.options)?;
        let mutations = req
            .mutations
            .into_iter()
            .map(mutation_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        let compares = req.compares;
        let gets = req.gets;
        let (outcome, result) = self
            .retry
            .run(&self.db, options, move |tx| {
                let (compares, gets, mutations) = (compares.clone(), gets.clone(), mutations.clone());
                Box::pin(async move {
                    let mut succeeded = true;
                    for compare in &compares {
                        if tx.get(&compare.key).await? != compare.value {
                            succeeded = false;
                        }
                    }
                    let mut results = Vec::with_capacity(gets.len());
                    for key in gets {
                        let value = tx.get(&key).await?;
                        results.push(pb::GetResult { key, value });
                    }
                    if succeeded {
                        for mutation in mutations {
                            tx.write(mutation)?;
                        }
                    }
                    Ok::<_, RkvError>(TxnOutcome { succeeded, gets: results, observed: Observed::of(&*tx) })
                })
            })
            .await
            .map_err(rkv_to_status)?;
        Ok(Response::new(TxnResponse {
            header: Some(self.header(&outcome.observed)),
            succeeded: outcome.succeeded,
            gets: outcome.gets,
            index: result.index,
        }))
    }
}

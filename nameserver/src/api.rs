use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use junknas_nameserver::{
    BlockAssignment, BlockId, BlockInfo, DataServerInfo, DirectoryInfo, DiskMetrics, EntryInfo,
    ErrorKind, FileDeleted, FileInfo, FileOptions, FileSystem, HeartbeatCommand, NamespaceError,
    RecordOptions, ReplicaPlacement,
};

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

/// Shared name server state across API handlers.
pub struct AppState {
    pub fs: Arc<FileSystem>,
    pub placement: ReplicaPlacement,

    /// Storage servers, keyed by `host:port`.
    pub servers: Mutex<HashMap<String, Arc<DataServerInfo>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(fs: Arc<FileSystem>) -> Self {
        let placement = ReplicaPlacement::new(fs.config().min_free_bytes);
        AppState {
            fs,
            placement,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> Vec<Arc<DataServerInfo>> {
        let servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        let mut v: Vec<_> = servers.values().cloned().collect();
        v.sort_by(|a, b| a.address().cmp(b.address()));
        v
    }

    /// Servers that have reported in and could take a new replica.
    fn available_servers(&self, servers: &[Arc<DataServerInfo>]) -> usize {
        let min_free = self.fs.config().min_free_bytes;
        servers
            .iter()
            .filter(|s| s.has_reported() && s.disk().free_bytes >= min_free)
            .count()
    }

    fn place(&self, block: &BlockInfo, writer: Option<&str>) -> ApiResult<BlockAssignment> {
        let servers = self.servers();
        let assignment = self.placement.assign(
            block,
            &servers,
            writer,
            self.fs.config().use_local_replica,
        )?;
        Ok(assignment)
    }
}

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(NamespaceError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<NamespaceError> for ApiError {
    fn from(e: NamespaceError) -> Self {
        ApiError(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub fn status_of(e: &NamespaceError) -> StatusCode {
    match (e.kind(), e) {
        (_, NamespaceError::NotFound(_)) => StatusCode::NOT_FOUND,
        (ErrorKind::Malformed, _) => StatusCode::BAD_REQUEST,
        (ErrorKind::Conflict, _) => StatusCode::CONFLICT,
        (ErrorKind::Resources, _) => StatusCode::SERVICE_UNAVAILABLE,
        (ErrorKind::Durability, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: format!("{:?}", self.0.kind()).to_lowercase(),
        };
        (status, Json(body)).into_response()
    }
}

// -----------------------------------------------------------------------------
// Lookups
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

/// GET /api/fs/lookup
pub async fn lookup(
    State(state): State<SharedState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<EntryInfo>> {
    state
        .fs
        .get_entry_info(&q.path)?
        .map(Json)
        .ok_or_else(|| NamespaceError::NotFound(q.path).into())
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub path: String,
    pub entries: Vec<String>,
}

/// GET /api/fs/list
pub async fn list(
    State(state): State<SharedState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<ListResponse>> {
    let entries = state.fs.list_directory(&q.path)?;
    Ok(Json(ListResponse {
        path: q.path,
        entries,
    }))
}

/// Runs a namespace mutation off the async workers, since edit-log appends
/// fsync under the namespace lock.
async fn blocking<T, F>(state: &SharedState, f: F) -> ApiResult<T>
where
    F: FnOnce(&AppState) -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError(NamespaceError::Io(std::io::Error::other(e))))?
}

/// A new block is placed relative to its writer, so one must be named.
fn require_writer(writer: Option<&str>) -> ApiResult<&str> {
    match writer.map(str::trim) {
        Some(w) if !w.is_empty() => Ok(w),
        _ => Err(NamespaceError::InvalidArgument(
            "a writer address is required to place a new block".into(),
        )
        .into()),
    }
}

// -----------------------------------------------------------------------------
// Create
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// POST /api/fs/mkdir
pub async fn mkdir(
    State(state): State<SharedState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<Json<DirectoryInfo>> {
    let dir = blocking(&state, move |s| Ok(s.fs.create_directory(&req.path)?)).await?;
    Ok(Json(dir))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    pub block_size: u64,
    pub replication_factor: u32,
    #[serde(default)]
    pub record_options: RecordOptions,
    /// Allocate and place the first block straight away.
    #[serde(default)]
    pub append_block: bool,
    /// `host:port` of the writing client; required with `append_block`.
    pub writer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub file: FileInfo,
    pub first_block: Option<BlockAssignment>,
}

/// POST /api/fs/create
pub async fn create(
    State(state): State<SharedState>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<Json<CreateResponse>> {
    let response = blocking(&state, move |s| {
        if req.append_block {
            require_writer(req.writer.as_deref())?;
        }
        let available = s.available_servers(&s.servers());
        let options = FileOptions {
            block_size: req.block_size,
            replication_factor: req.replication_factor,
            record_options: req.record_options,
        };
        let created = s
            .fs
            .create_file(&req.path, options, req.append_block, available)?;

        let first_block = match &created.first_block {
            Some(block) => match s.place(block, req.writer.as_deref()) {
                Ok(assignment) => Some(assignment),
                Err(e) => {
                    // Nothing was handed out, so the file goes too.
                    if let Err(undo) = s.fs.delete(&req.path, false) {
                        warn!("cannot remove {} after failed placement: {}", req.path, undo);
                    }
                    return Err(e);
                }
            },
            None => None,
        };
        Ok(CreateResponse {
            file: created.file,
            first_block,
        })
    })
    .await?;
    Ok(Json(response))
}

// -----------------------------------------------------------------------------
// Blocks
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AppendBlockRequest {
    pub path: String,
    /// `host:port` of the writing client.
    pub writer: String,
}

/// POST /api/fs/append-block
pub async fn append_block(
    State(state): State<SharedState>,
    Json(req): Json<AppendBlockRequest>,
) -> ApiResult<Json<BlockAssignment>> {
    let assignment = blocking(&state, move |s| {
        let writer = require_writer(Some(req.writer.as_str()))?;
        let available = s.available_servers(&s.servers());
        let block = s.fs.append_block(&req.path, None, available)?;
        s.place(&block, Some(writer)).map_err(|e| {
            if let Err(undo) = s.fs.abandon_block(&req.path, block.block_id) {
                warn!("cannot abandon block {} of {}: {}", block.block_id, req.path, undo);
            }
            e
        })
    })
    .await?;
    Ok(Json(assignment))
}

#[derive(Debug, Deserialize)]
pub struct CommitBlockRequest {
    pub path: String,
    pub block_id: BlockId,
    pub size: u64,
}

/// POST /api/fs/commit-block
pub async fn commit_block(
    State(state): State<SharedState>,
    Json(req): Json<CommitBlockRequest>,
) -> ApiResult<StatusCode> {
    blocking(&state, move |s| {
        Ok(s.fs.commit_block(&req.path, req.block_id, req.size)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub pending_block: Option<BlockId>,
}

/// POST /api/fs/close
pub async fn close(
    State(state): State<SharedState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<Json<CloseResponse>> {
    let pending_block = blocking(&state, move |s| Ok(s.fs.close_file(&req.path)?)).await?;
    Ok(Json(CloseResponse { pending_block }))
}

#[derive(Debug, Serialize)]
pub struct BlocksResponse {
    pub blocks: Vec<BlockInfo>,
    pub pending_blocks: Vec<BlockInfo>,
}

/// GET /api/blocks
/// Block map for reconciling against storage server reports.
pub async fn blocks(State(state): State<SharedState>) -> Json<BlocksResponse> {
    let mut blocks = Vec::new();
    let mut pending_blocks = Vec::new();
    state.fs.get_blocks(&mut blocks, &mut pending_blocks);
    Json(BlocksResponse {
        blocks,
        pending_blocks,
    })
}

#[derive(Debug, Deserialize)]
pub struct ReplicateRequest {
    pub block_id: BlockId,
}

/// POST /api/blocks/replicate
/// Places the missing replicas of a committed block and asks one current
/// holder to copy it there.
pub async fn replicate(
    State(state): State<SharedState>,
    Json(req): Json<ReplicateRequest>,
) -> ApiResult<Json<BlockAssignment>> {
    let mut blocks = Vec::new();
    state.fs.get_blocks(&mut blocks, &mut Vec::new());
    let block = blocks
        .into_iter()
        .find(|b| b.block_id == req.block_id)
        .ok_or_else(|| NamespaceError::NotFound(req.block_id.to_string()))?;

    let assignment = state.place(&block, None)?;
    if !assignment.servers.is_empty() {
        let source = state.servers().into_iter().find(|s| s.holds(block.block_id));
        if let Some(source) = source {
            source.add_response_for_next_heartbeat(HeartbeatCommand::ReplicateBlock {
                block_id: block.block_id,
                targets: assignment.servers.clone(),
            });
        }
    }
    Ok(Json(assignment))
}

// -----------------------------------------------------------------------------
// Delete / move
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

/// DELETE /api/fs/delete
pub async fn delete(
    State(state): State<SharedState>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    blocking(&state, move |s| {
        if s.fs.delete(&q.path, q.recursive)? {
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(NamespaceError::NotFound(q.path).into())
        }
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub from: String,
    pub to: String,
}

/// POST /api/fs/move
pub async fn move_entry(
    State(state): State<SharedState>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<StatusCode> {
    blocking(&state, move |s| Ok(s.fs.move_entry(&req.from, &req.to)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/fs/checkpoint
pub async fn checkpoint(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    blocking(&state, |s| Ok(s.fs.save_to_image()?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -----------------------------------------------------------------------------
// Storage servers
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// `host:port` the server accepts block traffic on.
    pub address: String,
    #[serde(default)]
    pub rack: String,
    pub disk: DiskMetrics,
    /// Full block report, if the server sends one this round.
    pub blocks: Option<Vec<BlockId>>,
    /// Blocks received since the last heartbeat.
    #[serde(default)]
    pub received: Vec<BlockId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub commands: Vec<HeartbeatCommand>,
}

/// POST /api/servers/heartbeat
pub async fn heartbeat(
    State(state): State<SharedState>,
    Json(body): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let server = {
        let mut servers = state.servers.lock().unwrap_or_else(|e| e.into_inner());
        servers
            .entry(body.address.clone())
            .or_insert_with(|| {
                info!("storage server {} joined ({})", body.address, body.rack);
                Arc::new(DataServerInfo::new(body.address.clone(), body.rack.clone()))
            })
            .clone()
    };

    server.record_heartbeat(body.disk, Utc::now());
    if let Some(report) = body.blocks {
        server.report_blocks(report);
    }
    for block in body.received {
        server.confirm_block(block);
    }

    let commands = server.get_and_clear_pending_responses();
    if !commands.is_empty() {
        debug!(server = %body.address, commands = commands.len(), "delivering commands");
    }
    Json(HeartbeatResponse { commands })
}

// -----------------------------------------------------------------------------
// Deletion fan-out
// -----------------------------------------------------------------------------

/// Tells every server holding or receiving a deleted file's blocks to drop them.
pub fn queue_block_deletions(servers: &[Arc<DataServerInfo>], deleted: &FileDeleted) {
    let blocks: Vec<BlockId> = deleted
        .file
        .blocks
        .iter()
        .copied()
        .chain(deleted.pending_block)
        .collect();
    if blocks.is_empty() {
        return;
    }

    for server in servers {
        let doomed: Vec<BlockId> = blocks
            .iter()
            .copied()
            .filter(|b| server.holds(*b) || server.is_pending(*b))
            .collect();
        if doomed.is_empty() {
            continue;
        }
        server.remove_blocks(&doomed);
        server.add_response_for_next_heartbeat(HeartbeatCommand::DeleteBlocks { blocks: doomed });
    }
}

pub async fn run_deletion_fanout(
    state: SharedState,
    mut deletions: mpsc::UnboundedReceiver<FileDeleted>,
) {
    while let Some(deleted) = deletions.recv().await {
        debug!(path = %deleted.file.path, "queueing block deletions");
        queue_block_deletions(&state.servers(), &deleted);
    }
}

//! Upload and processing pipeline
//!
//! Drives each selected file through
//! `pending → uploading → uploaded → processing → completed`, with `error`
//! reachable from the in-flight states. Processing tasks are tracked by a
//! single background poller owned by the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{MissedTickBehavior, interval};

use ragdesk_core::knowledge::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use ragdesk_core::{
    Error, FileStatus, KnowledgeBaseApi, PreviewRequest, PreviewResponse, ProcessItem,
    ProcessingTask, Result, TaskState, TaskStatus, UploadResult, UploadState, UploadStatus,
};

const PROCESSING_FAILED: &str = "Processing failed";
const MISSING_UPLOAD_RESULT: &str = "No upload result returned for this file";
const MISSING_UPLOAD_ID: &str = "Upload response did not include an upload id";
const MISSING_TASK: &str = "No processing task returned for this file";

/// Cancellable handle to the running poll task
#[derive(Debug)]
pub struct PollHandle {
    abort: AbortHandle,
}

impl PollHandle {
    fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSnapshot {
    pub files: Vec<FileStatus>,
    pub polling: bool,
}

impl PipelineSnapshot {
    pub fn file(&self, file_name: &str) -> Option<&FileStatus> {
        self.files.iter().find(|f| f.file_name == file_name)
    }
}

#[derive(Default)]
struct State {
    files: Vec<FileStatus>,
    /// Tasks not yet reported completed or failed
    outstanding: Vec<ProcessingTask>,
    temp_paths: HashMap<i64, String>,
    poller: Option<PollHandle>,
}

impl State {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            files: self.files.clone(),
            polling: self.poller.is_some(),
        }
    }

    fn file_by_path(&mut self, path: &Path) -> Option<&mut FileStatus> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    fn file_by_upload(&mut self, upload_id: i64) -> Option<&mut FileStatus> {
        self.files
            .iter_mut()
            .find(|f| f.upload_id == Some(upload_id))
    }
}

struct Shared {
    state: Mutex<State>,
    updates: watch::Sender<PipelineSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(state.snapshot());
    }
}

/// Move a file to `next` if the transition is allowed
fn transition(file: &mut FileStatus, next: UploadStatus) -> bool {
    if !file.status.can_transition_to(next) {
        tracing::warn!(
            file = %file.file_name,
            from = %file.status,
            to = %next,
            "ignoring invalid status transition"
        );
        return false;
    }
    tracing::info!(file = %file.file_name, from = %file.status, to = %next, "file status changed");
    file.status = next;
    true
}

fn fail(file: &mut FileStatus, message: impl Into<String>) {
    if transition(file, UploadStatus::Error) {
        file.error = Some(message.into());
    }
}

/// Upload/processing workflow for one knowledge base
pub struct UploadPipeline<A: KnowledgeBaseApi + ?Sized + 'static> {
    api: Arc<A>,
    kb_id: i64,
    poll_interval: Duration,
    shared: Arc<Shared>,
}

impl<A: KnowledgeBaseApi + ?Sized + 'static> UploadPipeline<A> {
    pub fn new(api: Arc<A>, kb_id: i64, poll_interval: Duration) -> Self {
        let (updates, _) = watch::channel(PipelineSnapshot::default());
        Self {
            api,
            kb_id,
            poll_interval,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                updates,
            }),
        }
    }

    pub fn kb_id(&self) -> i64 {
        self.kb_id
    }

    /// Track new files as `pending`; paths already tracked are ignored
    pub fn add_files<I, P>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut state = self.shared.lock();
        let mut added = 0;
        for path in paths {
            let path = path.into();
            if state.files.iter().any(|f| f.path == path) {
                tracing::debug!(path = %path.display(), "file already tracked");
                continue;
            }
            state.files.push(FileStatus::pending(path));
            added += 1;
        }
        self.shared.publish(&state);
        added
    }

    /// Stop tracking a file in any state. Backend work already submitted
    /// for it keeps running.
    pub fn remove_file(&self, path: &Path) -> bool {
        let mut state = self.shared.lock();
        let Some(index) = state.files.iter().position(|f| f.path == path) else {
            return false;
        };
        let removed = state.files.remove(index);
        if let Some(upload_id) = removed.upload_id {
            state.outstanding.retain(|t| t.upload_id != upload_id);
            state.temp_paths.remove(&upload_id);
        }
        self.shared.publish(&state);
        true
    }

    pub fn files(&self) -> Vec<FileStatus> {
        self.shared.lock().files.clone()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.lock().poller.is_some()
    }

    /// Receive a snapshot after every change
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Wait until no poller is running and return the final snapshot
    pub async fn wait_until_settled(&self) -> PipelineSnapshot {
        let mut updates = self.subscribe();
        let settled = match updates.wait_for(|s| !s.polling).await {
            Ok(snapshot) => Some(snapshot.clone()),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| self.snapshot())
    }

    /// Upload every `pending` file in one request.
    ///
    /// Files the backend already holds go straight to `completed`; the rest
    /// land in `uploaded`. A failed request marks the whole batch `error`
    /// and is returned to the caller.
    pub async fn upload(&self) -> Result<Vec<FileStatus>> {
        let paths: Vec<PathBuf> = {
            let mut state = self.shared.lock();
            let paths = state
                .files
                .iter_mut()
                .filter(|f| f.status == UploadStatus::Pending)
                .filter_map(|f| transition(f, UploadStatus::Uploading).then(|| f.path.clone()))
                .collect();
            self.shared.publish(&state);
            paths
        };

        if paths.is_empty() {
            return Ok(self.files());
        }

        let outcome = self.api.upload_documents(self.kb_id, &paths).await;

        let mut state = self.shared.lock();
        match outcome {
            Ok(results) => {
                let mut results: Vec<Option<UploadResult>> = results.into_iter().map(Some).collect();
                for path in &paths {
                    let Some(file) = state.file_by_path(path) else {
                        continue;
                    };
                    let result = results
                        .iter_mut()
                        .find(|r| r.as_ref().is_some_and(|r| r.file_name == file.file_name))
                        .and_then(Option::take);
                    let temp = apply_upload_result(file, result);
                    if let Some((upload_id, temp_path)) = temp {
                        state.temp_paths.insert(upload_id, temp_path);
                    }
                }
                self.shared.publish(&state);
                Ok(state.files.clone())
            }
            Err(e) => {
                for path in &paths {
                    if let Some(file) = state.file_by_path(path) {
                        fail(file, e.to_string());
                    }
                }
                self.shared.publish(&state);
                Err(e)
            }
        }
    }

    /// Preview the chunking of an uploaded file
    pub async fn preview(
        &self,
        path: &Path,
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
    ) -> Result<PreviewResponse> {
        let document_id = {
            let state = self.shared.lock();
            let file = state
                .files
                .iter()
                .find(|f| f.path == path)
                .ok_or_else(|| Error::InvalidInput(format!("{} is not tracked", path.display())))?;
            file.document_id.or(file.upload_id).ok_or_else(|| {
                Error::InvalidInput(format!("{} has not been uploaded yet", file.file_name))
            })?
        };

        let request = PreviewRequest {
            document_ids: vec![document_id],
            chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
        };
        self.api.preview_document(self.kb_id, &request).await
    }

    /// Submit every `uploaded` file for processing and make sure the poller
    /// is tracking the returned tasks
    pub async fn start_processing(&self) -> Result<()> {
        let items: Vec<ProcessItem> = {
            let mut state = self.shared.lock();
            let State {
                files, temp_paths, ..
            } = &mut *state;
            let mut items = Vec::new();
            for file in files.iter_mut().filter(|f| f.status == UploadStatus::Uploaded) {
                let Some(upload_id) = file.upload_id else {
                    continue;
                };
                if transition(file, UploadStatus::Processing) {
                    items.push(ProcessItem {
                        upload_id,
                        file_name: file.file_name.clone(),
                        status: UploadState::Pending,
                        skip_processing: false,
                        temp_path: temp_paths.get(&upload_id).cloned(),
                    });
                }
            }
            self.shared.publish(&state);
            items
        };

        if items.is_empty() {
            tracing::debug!("no uploaded files to process");
            return Ok(());
        }

        let outcome = self.api.process_documents(self.kb_id, &items).await;

        let mut state = self.shared.lock();
        match outcome {
            Ok(list) => {
                for item in &items {
                    let task = list.tasks.iter().find(|t| t.upload_id == item.upload_id).copied();
                    let Some(file) = state.file_by_upload(item.upload_id) else {
                        continue;
                    };
                    match task {
                        Some(task) => {
                            file.task_id = Some(task.task_id);
                            if !state.outstanding.iter().any(|t| t.task_id == task.task_id) {
                                state.outstanding.push(task);
                            }
                        }
                        None => fail(file, MISSING_TASK),
                    }
                }
                self.ensure_poller(&mut state);
                self.shared.publish(&state);
                Ok(())
            }
            Err(e) => {
                for item in &items {
                    if let Some(file) = state.file_by_upload(item.upload_id) {
                        fail(file, e.to_string());
                    }
                }
                self.shared.publish(&state);
                Err(e)
            }
        }
    }

    /// Spawn the poller unless one is already running. Called with the state
    /// lock held, which makes check-and-spawn atomic.
    fn ensure_poller(&self, state: &mut State) {
        if state.outstanding.is_empty() {
            return;
        }
        if state.poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }

        let task = tokio::spawn(poll_loop(
            self.api.clone(),
            self.shared.clone(),
            self.kb_id,
            self.poll_interval,
        ));
        tracing::debug!(kb_id = self.kb_id, tasks = state.outstanding.len(), "started polling");
        state.poller = Some(PollHandle::new(task.abort_handle()));
    }

    /// Stop polling without touching file state
    pub fn cancel_polling(&self) {
        let mut state = self.shared.lock();
        if let Some(poller) = state.poller.take() {
            poller.cancel();
            tracing::debug!(kb_id = self.kb_id, "polling cancelled");
        }
        self.shared.publish(&state);
    }
}

impl<A: KnowledgeBaseApi + ?Sized + 'static> Drop for UploadPipeline<A> {
    fn drop(&mut self) {
        if let Some(poller) = self.shared.lock().poller.take() {
            poller.cancel();
        }
    }
}

/// Apply one upload result; returns the temp path to keep for processing
fn apply_upload_result(
    file: &mut FileStatus,
    result: Option<UploadResult>,
) -> Option<(i64, String)> {
    let Some(result) = result else {
        fail(file, MISSING_UPLOAD_RESULT);
        return None;
    };

    file.message = result.message.clone();

    if result.already_ingested() {
        file.document_id = result.document_id;
        file.upload_id = result.upload_id;
        transition(file, UploadStatus::Completed);
        return None;
    }

    let Some(upload_id) = result.upload_id else {
        fail(file, MISSING_UPLOAD_ID);
        return None;
    };

    file.upload_id = Some(upload_id);
    transition(file, UploadStatus::Uploaded);
    result.temp_path.map(|temp_path| (upload_id, temp_path))
}

async fn poll_loop<A: KnowledgeBaseApi + ?Sized>(
    api: Arc<A>,
    shared: Arc<Shared>,
    kb_id: i64,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(task_ids) = take_outstanding(&shared) else {
            tracing::debug!(kb_id, "all processing tasks settled");
            return;
        };

        match api.task_status(kb_id, &task_ids).await {
            Ok(statuses) => {
                let mut state = shared.lock();
                merge_statuses(&mut state, &statuses);
                if state.outstanding.is_empty() {
                    state.poller = None;
                    shared.publish(&state);
                    tracing::debug!(kb_id, "all processing tasks settled");
                    return;
                }
                shared.publish(&state);
            }
            Err(e) => {
                tracing::warn!(kb_id, error = %e, "task status check failed, stopping polling");
                let mut state = shared.lock();
                let outstanding = std::mem::take(&mut state.outstanding);
                for task in outstanding {
                    if let Some(file) = state.file_by_upload(task.upload_id) {
                        fail(file, e.to_string());
                    }
                }
                state.poller = None;
                shared.publish(&state);
                return;
            }
        }
    }
}

/// Ids of the outstanding tasks, or `None` after clearing the poller when
/// nothing is left to track
fn take_outstanding(shared: &Shared) -> Option<Vec<i64>> {
    let mut state = shared.lock();
    if state.outstanding.is_empty() {
        state.poller = None;
        shared.publish(&state);
        return None;
    }
    Some(state.outstanding.iter().map(|t| t.task_id).collect())
}

fn merge_statuses(state: &mut State, statuses: &HashMap<i64, TaskStatus>) {
    let outstanding = std::mem::take(&mut state.outstanding);
    for task in outstanding {
        let Some(status) = statuses.get(&task.task_id) else {
            state.outstanding.push(task);
            continue;
        };

        let upload_id = status.upload_id.unwrap_or(task.upload_id);
        let Some(file) = state.file_by_upload(upload_id) else {
            tracing::debug!(upload_id, "status for an untracked file");
            continue;
        };

        match status.status {
            TaskState::Pending | TaskState::Processing => {
                state.outstanding.push(task);
            }
            TaskState::Completed => {
                file.document_id = status.document_id.or(file.document_id);
                transition(file, UploadStatus::Completed);
            }
            TaskState::Failed => {
                let message = status
                    .error_message
                    .clone()
                    .unwrap_or_else(|| PROCESSING_FAILED.to_string());
                fail(file, message);
            }
        }
    }
}

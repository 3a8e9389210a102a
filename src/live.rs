// src/live.rs - Isolated per-client rolling buffers for streaming recognition
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::assembler::ScoredFrame;
use crate::error::RecognitionError;
use crate::landmarks::{FrameLandmarks, LandmarkAdapter, LandmarkDetector};
use crate::pipeline::{Recognition, Recognizer};

struct SessionState {
    adapter: LandmarkAdapter,
    buffer: VecDeque<ScoredFrame>,
    /// Bumped on reset/remove; stale predictions compare against it.
    generation: u64,
    frames_seen: u64,
    created_at: DateTime<Utc>,
}

struct Session {
    state: Mutex<SessionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub session_id: Uuid,
    pub buffered: usize,
    pub capacity: usize,
    pub frames_seen: u64,
    /// Enough frames for a full-length sequence without padding.
    pub ready: bool,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// Frames captured for a prediction, tagged with the generation they came from.
pub struct PendingPrediction {
    session_id: Uuid,
    generation: u64,
    frames: Vec<ScoredFrame>,
}

impl PendingPrediction {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

pub struct SessionRegistry {
    recognizer: Arc<Recognizer>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(recognizer: Arc<Recognizer>) -> Self {
        let capacity = recognizer.config().live.buffer_capacity;
        Self {
            recognizer,
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn create_session(&self, detector: Box<dyn LandmarkDetector>) -> Result<Uuid, RecognitionError> {
        let adapter = self.recognizer.new_adapter(detector)?;
        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            state: Mutex::new(SessionState {
                adapter,
                buffer: VecDeque::with_capacity(self.capacity),
                generation: 0,
                frames_seen: 0,
                created_at: Utc::now(),
            }),
        });

        self.sessions
            .write()
            .map_err(|_| RecognitionError::Worker("session table lock poisoned".to_string()))?
            .insert(id, session);
        info!("Created live session {}", id);
        Ok(id)
    }

    /// Runs the frame through the session's detector on a blocking worker.
    pub async fn push_frame(
        &self,
        id: Uuid,
        frame: DynamicImage,
    ) -> Result<SessionProgress, RecognitionError> {
        let session = self.session(id)?;
        let recognizer = self.recognizer.clone();
        let capacity = self.capacity;

        tokio::task::spawn_blocking(move || -> Result<SessionProgress, RecognitionError> {
            let mut state = lock(&session, id)?;
            let scored = recognizer.assembler().process_frame(&mut state.adapter, &frame);
            push_scored(&mut state, scored, capacity);
            Ok(progress_of(id, &state, capacity, recognizer.config().sequence_length))
        })
        .await
        .map_err(|e| RecognitionError::Worker(e.to_string()))?
    }

    /// Adds a frame whose landmarks were detected elsewhere.
    pub fn push_landmarks(
        &self,
        id: Uuid,
        landmarks: &FrameLandmarks,
    ) -> Result<SessionProgress, RecognitionError> {
        let session = self.session(id)?;
        let scored = self.recognizer.assembler().score_landmarks(landmarks);
        let mut state = lock(&session, id)?;
        push_scored(&mut state, scored, self.capacity);
        Ok(progress_of(
            id,
            &state,
            self.capacity,
            self.recognizer.config().sequence_length,
        ))
    }

    pub fn progress(&self, id: Uuid) -> Result<SessionProgress, RecognitionError> {
        let session = self.session(id)?;
        let state = lock(&session, id)?;
        Ok(progress_of(
            id,
            &state,
            self.capacity,
            self.recognizer.config().sequence_length,
        ))
    }

    pub async fn predict(&self, id: Uuid) -> Result<Recognition, RecognitionError> {
        let pending = self.snapshot(id)?;
        self.complete(pending).await
    }

    /// Copies the current buffer out from under the session lock.
    pub fn snapshot(&self, id: Uuid) -> Result<PendingPrediction, RecognitionError> {
        let session = self.session(id)?;
        let state = lock(&session, id)?;
        Ok(PendingPrediction {
            session_id: id,
            generation: state.generation,
            frames: state.buffer.iter().cloned().collect(),
        })
    }

    /// Assembles and classifies a snapshot. Fails with `SessionReset` if the
    /// session was reset or removed after the snapshot was taken.
    pub async fn complete(&self, pending: PendingPrediction) -> Result<Recognition, RecognitionError> {
        let id = pending.session_id;
        let session = self.session(id).map_err(|_| RecognitionError::SessionReset(id))?;
        let recognizer = self.recognizer.clone();

        tokio::task::spawn_blocking(move || -> Result<Recognition, RecognitionError> {
            let assembled = recognizer.assembler().assemble_scored(pending.frames)?;
            ensure_generation(&session, id, pending.generation)?;

            let recognition = recognizer.infer(assembled)?;
            // a reset may land while the model runs
            ensure_generation(&session, id, pending.generation)?;
            Ok(recognition)
        })
        .await
        .map_err(|e| RecognitionError::Worker(e.to_string()))?
    }

    pub fn reset(&self, id: Uuid) -> Result<(), RecognitionError> {
        let session = self.session(id)?;
        let mut state = lock(&session, id)?;
        state.buffer.clear();
        state.generation += 1;
        debug!("Reset session {} (generation {})", id, state.generation);
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Result<(), RecognitionError> {
        let session = self
            .sessions
            .write()
            .map_err(|_| RecognitionError::Worker("session table lock poisoned".to_string()))?
            .remove(&id)
            .ok_or(RecognitionError::SessionUnavailable(id))?;

        if let Ok(mut state) = session.state.lock() {
            state.buffer.clear();
            state.generation += 1;
        }
        info!("Removed live session {}", id);
        Ok(())
    }

    fn session(&self, id: Uuid) -> Result<Arc<Session>, RecognitionError> {
        self.sessions
            .read()
            .map_err(|_| RecognitionError::Worker("session table lock poisoned".to_string()))?
            .get(&id)
            .cloned()
            .ok_or(RecognitionError::SessionUnavailable(id))
    }
}

fn lock(session: &Session, id: Uuid) -> Result<MutexGuard<'_, SessionState>, RecognitionError> {
    session
        .state
        .lock()
        .map_err(|_| RecognitionError::SessionUnavailable(id))
}

fn ensure_generation(session: &Session, id: Uuid, generation: u64) -> Result<(), RecognitionError> {
    let current = lock(session, id)?.generation;
    if current != generation {
        debug!(
            "Session {} moved from generation {} to {}; dropping prediction",
            id, generation, current
        );
        return Err(RecognitionError::SessionReset(id));
    }
    Ok(())
}

fn push_scored(state: &mut SessionState, frame: ScoredFrame, capacity: usize) {
    state.buffer.push_back(frame);
    while state.buffer.len() > capacity {
        state.buffer.pop_front();
    }
    state.frames_seen += 1;
}

fn progress_of(id: Uuid, state: &SessionState, capacity: usize, sequence_length: usize) -> SessionProgress {
    SessionProgress {
        session_id: id,
        buffered: state.buffer.len(),
        capacity,
        frames_seen: state.frames_seen,
        ready: state.buffer.len() >= sequence_length,
        generation: state.generation,
        created_at: state.created_at,
    }
}

//! Write-session lifecycle of a directory
//!
//! Lock order: `entry.session` → `entry.meta` / `StreamManager` state /
//! `tracked` → `outbox`. Events raised while these are held wait in the
//! outbox and are published once the caller has released them.
//!
//! An append handle is identified by the file's handle epoch at attach
//! time. Closing a segment with its handle still attached closes the handle
//! too: the epoch moves on and the claim is released. A plain handle that
//! writes again re-claims the file and starts a fresh segment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{MuxError, Result};
use crate::event::MuxEvent;
use crate::file::{now_millis, FileEntry, WriteSession, WriteState, WRITE_BUFFER_SIZE};

use super::DirectoryInner;

impl DirectoryInner {
    // =========================================================================
    // Append Handles
    // =========================================================================

    /// Register a new append handle on `entry`. Returns the handle's epoch.
    pub(crate) fn attach_writer(&self, entry: &Arc<FileEntry>, compressed: bool) -> Result<u64> {
        self.check_writable()?;
        if !entry.claim_writer() {
            return Err(MuxError::AppendConflict(entry.name.clone()));
        }

        let attached = self.attach_claimed(entry, compressed);
        if attached.is_err() {
            entry.release_writer();
        }
        self.publish_pending();
        let (epoch, closed_lingering) = attached?;

        if closed_lingering {
            self.persist()?;
        }
        Ok(epoch)
    }

    fn attach_claimed(&self, entry: &Arc<FileEntry>, compressed: bool) -> Result<(u64, bool)> {
        if entry.meta.read().deleted {
            return Err(MuxError::FileNotFound(entry.name.clone()));
        }

        let mut slot = entry.session.lock();
        self.register_writer(entry)?;
        self.touch();
        let epoch = entry.handle_epoch.load(Ordering::SeqCst);

        if compressed {
            // An LZ4 frame needs a segment of its own
            return match self.close_session_locked(entry, &mut slot) {
                Ok(closed) => Ok((epoch, closed)),
                Err(e) => {
                    self.unregister_writer(entry);
                    Err(e)
                }
            };
        }

        if let Some(session) = slot.as_mut().filter(|s| s.is_live()) {
            session.attached = true;
            debug!(file = %entry.name, stream_id = session.stream_id, "append handle continues open segment");
        }
        Ok((epoch, false))
    }

    /// Buffer bytes from an append handle, opening a session when needed
    ///
    /// `epoch` is updated when a plain handle closed with its segment
    /// re-claims the file.
    pub(crate) fn session_write(
        &self,
        entry: &Arc<FileEntry>,
        data: &[u8],
        compressed: bool,
        epoch: &mut u64,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_open()?;

        let result = self.session_write_inner(entry, data, compressed, epoch);
        self.publish_pending();
        result
    }

    fn session_write_inner(
        &self,
        entry: &Arc<FileEntry>,
        data: &[u8],
        compressed: bool,
        epoch: &mut u64,
    ) -> Result<()> {
        let mut slot = entry.session.lock();
        if entry.handle_epoch.load(Ordering::SeqCst) != *epoch {
            *epoch = self.reattach_locked(entry, compressed)?;
        }

        if !slot.as_ref().map_or(false, |s| s.is_live()) {
            let stream_id = self.streams.allocate_stream()?;
            {
                let mut tracked = self.tracked.lock();
                if self.closed.load(Ordering::SeqCst) {
                    drop(tracked);
                    self.streams.release(&[stream_id]);
                    return Err(MuxError::DirectoryClosed(self.path.clone()));
                }
                tracked.sessions.insert(entry.file_id, entry.clone());
            }
            *slot = Some(WriteSession::new(stream_id, compressed));
            self.queue_event(MuxEvent::StreamsReported { streams: 1 });
            debug!(file = %entry.name, stream_id, compressed, "write session opened");
        }

        let Some(session) = slot.as_mut() else {
            return Err(MuxError::Corruption(format!(
                "write session of {} vanished",
                entry.name
            )));
        };

        session.buffer.extend_from_slice(data);
        session.last_write = Instant::now();
        session.state = WriteState::Open;

        if session.buffer.len() >= WRITE_BUFFER_SIZE {
            self.push_locked(session)?;
        }

        if !session.timer_armed {
            session.timer_armed = true;
            self.arm_timer(entry.file_id, session.last_write + self.config.write_close_grace / 2);
        }

        self.touch();
        Ok(())
    }

    /// Claim the file again for a handle that was closed with its segment
    fn reattach_locked(&self, entry: &Arc<FileEntry>, compressed: bool) -> Result<u64> {
        // The rest of an LZ4 frame would not be a readable segment
        if compressed {
            return Err(MuxError::HandleClosed(entry.name.clone()));
        }
        if entry.meta.read().deleted {
            return Err(MuxError::FileNotFound(entry.name.clone()));
        }
        if !entry.claim_writer() {
            return Err(MuxError::AppendConflict(entry.name.clone()));
        }
        if let Err(e) = self.register_writer(entry) {
            entry.release_writer();
            return Err(e);
        }

        debug!(file = %entry.name, "append handle reattached");
        Ok(entry.handle_epoch.load(Ordering::SeqCst))
    }

    /// Push buffered bytes, committing them to the file when `commit`
    pub(crate) fn session_flush(&self, entry: &Arc<FileEntry>, commit: bool, epoch: u64) -> Result<()> {
        let result = self.session_flush_inner(entry, commit, epoch);
        self.publish_pending();
        result
    }

    fn session_flush_inner(&self, entry: &Arc<FileEntry>, commit: bool, epoch: u64) -> Result<()> {
        let mut slot = entry.session.lock();
        if entry.handle_epoch.load(Ordering::SeqCst) != epoch {
            // Closed with its segment; nothing of this handle is buffered
            return Ok(());
        }
        let Some(session) = slot.as_mut().filter(|s| s.is_live()) else {
            return Ok(());
        };

        self.push_locked(session)?;
        if commit {
            self.commit_locked(entry, session);
            session.state = WriteState::Idle;
        }
        Ok(())
    }

    /// Release an append handle
    ///
    /// Plain sessions commit and go IDLE; the grace timer closes them later.
    /// Compressed sessions close right away. A handle already closed with
    /// its segment has nothing left to release.
    pub(crate) fn detach_writer(&self, entry: &Arc<FileEntry>, compressed: bool, epoch: u64) -> Result<()> {
        let result = self.detach_inner(entry, compressed, epoch);
        self.publish_pending();

        if result? {
            self.persist()?;
        }
        Ok(())
    }

    fn detach_inner(&self, entry: &Arc<FileEntry>, compressed: bool, epoch: u64) -> Result<bool> {
        let mut slot = entry.session.lock();
        if entry.handle_epoch.load(Ordering::SeqCst) != epoch {
            return Ok(false);
        }

        let result = self.detach_claimed_locked(entry, compressed, &mut slot);
        // Detach even when the push failed, so the claim is never leaked
        if entry.handle_epoch.load(Ordering::SeqCst) == epoch {
            self.release_handle_locked(entry);
        }
        result
    }

    fn detach_claimed_locked(
        &self,
        entry: &FileEntry,
        compressed: bool,
        slot: &mut Option<WriteSession>,
    ) -> Result<bool> {
        let Some(session) = slot.as_mut().filter(|s| s.is_live()) else {
            return Ok(false);
        };

        session.attached = false;
        if !compressed {
            self.push_locked(session)?;
            self.commit_locked(entry, session);
            session.state = WriteState::Idle;
            return Ok(false);
        }

        self.close_session_locked(entry, slot)
    }

    fn register_writer(&self, entry: &Arc<FileEntry>) -> Result<()> {
        let mut tracked = self.tracked.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::DirectoryClosed(self.path.clone()));
        }
        tracked.writers.insert(entry.file_id, entry.clone());
        Ok(())
    }

    fn unregister_writer(&self, entry: &FileEntry) {
        self.tracked.lock().writers.remove(&entry.file_id);
        self.released.notify_all();
    }

    /// End the current handle of `entry`. Caller holds `entry.session`.
    fn release_handle_locked(&self, entry: &FileEntry) {
        entry.handle_epoch.fetch_add(1, Ordering::SeqCst);
        self.unregister_writer(entry);
        entry.release_writer();
    }

    // =========================================================================
    // Grace Timers
    // =========================================================================

    fn arm_timer(&self, file_id: u32, deadline: Instant) {
        let Some(scheduler) = self.scheduler.as_ref() else {
            return;
        };
        let dir = self.self_ref.clone();
        scheduler.schedule(
            deadline,
            Box::new(move || {
                if let Some(dir) = dir.upgrade() {
                    dir.on_grace_elapsed(file_id);
                }
            }),
        );
    }

    /// Timer callback driving OPEN → IDLE → CLOSE_PENDING → CLOSED
    ///
    /// Half a grace interval without writes marks the session IDLE; a full
    /// one closes it. Writes only move `last_write`, so a timer that fires
    /// early re-arms itself for the pushed-out deadline.
    pub(crate) fn on_grace_elapsed(&self, file_id: u32) {
        let Some(entry) = self.tracked.lock().sessions.get(&file_id).cloned() else {
            return;
        };

        let closed = {
            let mut slot = entry.session.lock();
            let Some(session) = slot.as_mut() else {
                return;
            };
            if !session.is_live() {
                session.timer_armed = false;
                return;
            }

            let now = Instant::now();
            let grace = self.config.write_close_grace;
            let due = session.last_write + grace;

            if due > now {
                let idle_at = session.last_write + grace / 2;
                if session.state == WriteState::Open && now >= idle_at {
                    session.state = WriteState::Idle;
                }
                let next = if session.state == WriteState::Open { idle_at } else { due };
                self.arm_timer(file_id, next);
                return;
            }
            if session.compressed && session.attached {
                // A half-written LZ4 frame is not a readable segment
                self.arm_timer(file_id, now + grace);
                return;
            }

            session.timer_armed = false;
            self.close_session_locked(&entry, &mut slot)
        };
        self.publish_pending();

        match closed {
            Ok(true) => {
                if let Err(e) = self.persist() {
                    warn!(path = %self.path.display(), error = %e, "failed to persist after session close");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(file = %entry.name, error = %e, "failed to close write session");
            }
        }
    }

    // =========================================================================
    // Session Helpers
    // =========================================================================

    /// Close a live session: push, commit, seal. Returns false if none was live.
    ///
    /// A handle still attached to the session is closed with it.
    pub(crate) fn close_session_locked(
        &self,
        entry: &FileEntry,
        slot: &mut Option<WriteSession>,
    ) -> Result<bool> {
        let Some(session) = slot.as_mut().filter(|s| s.is_live()) else {
            return Ok(false);
        };

        session.state = WriteState::ClosePending;
        self.push_locked(session)?;

        if session.compressed && session.attached {
            warn!(
                file = %entry.name,
                stream_id = session.stream_id,
                bytes = session.uncommitted,
                "discarding unfinished compressed segment"
            );
            session.uncommitted = 0;
        } else {
            self.commit_locked(entry, session);
        }

        self.streams.seal(session.stream_id)?;
        session.state = WriteState::Closed;
        session.timer_armed = false;

        let had_handle = session.attached;
        session.attached = false;
        let stream_id = session.stream_id;

        self.tracked.lock().sessions.remove(&entry.file_id);
        self.released.notify_all();

        if had_handle {
            self.release_handle_locked(entry);
        }

        debug!(file = %entry.name, stream_id, closed_handle = had_handle, "write session closed");
        Ok(true)
    }

    fn push_locked(&self, session: &mut WriteSession) -> Result<()> {
        if session.buffer.is_empty() {
            return Ok(());
        }
        self.streams.write(session.stream_id, &session.buffer)?;
        session.uncommitted += session.buffer.len() as u64;
        session.buffer.clear();
        Ok(())
    }

    fn commit_locked(&self, entry: &FileEntry, session: &mut WriteSession) {
        if session.uncommitted == 0 {
            return;
        }

        let bytes = session.uncommitted;
        {
            let mut meta = entry.meta.write();
            if !session.listed {
                meta.stream_ids.push(session.stream_id);
                session.listed = true;
            }
            meta.length += bytes;
            meta.last_modified = now_millis();
        }
        session.uncommitted = 0;

        self.queue_event(MuxEvent::WriteReported { bytes });
    }

    /// Close every live session and every attached handle regardless of
    /// grace. Returns how many sessions closed.
    pub(crate) fn force_close_all(&self) -> usize {
        let (sessions, writers): (Vec<Arc<FileEntry>>, Vec<Arc<FileEntry>>) = {
            let tracked = self.tracked.lock();
            (
                tracked.sessions.values().cloned().collect(),
                tracked.writers.values().cloned().collect(),
            )
        };
        let mut closed = 0;

        for entry in sessions {
            let mut slot = entry.session.lock();
            match self.close_session_locked(&entry, &mut slot) {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(file = %entry.name, error = %e, "forced session close failed");
                    // Never leave a broken session blocking closure
                    if let Some(session) = slot.as_mut() {
                        session.state = WriteState::Closed;
                        session.attached = false;
                    }
                    self.tracked.lock().sessions.remove(&entry.file_id);
                    self.released.notify_all();
                }
            }
        }

        // Handles with no live session left
        for entry in writers {
            let _slot = entry.session.lock();
            let still_attached = self.tracked.lock().writers.contains_key(&entry.file_id);
            if still_attached {
                self.release_handle_locked(&entry);
                debug!(file = %entry.name, "append handle closed by forced closure");
            }
        }

        self.publish_pending();
        closed
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Hold an event until no directory lock is held
    fn queue_event(&self, event: MuxEvent) {
        self.outbox.lock().push(event);
    }

    /// Publish queued events. Callers must not hold any directory lock.
    pub(crate) fn publish_pending(&self) {
        let events = std::mem::take(&mut *self.outbox.lock());
        for event in events {
            self.events.publish(event);
        }
    }
}

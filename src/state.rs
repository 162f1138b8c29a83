//! Shared per-thread state machine driving the flusher and fsyncer agents.
//!
//! Both agents are cooperatively cancelled the same way: the owning
//! `NvWal` instance requests a transition, and the agent thread observes it
//! at the top of its loop and at other quiescent points. There is no hard
//! preemption — a thread already inside a blocking I/O call finishes that
//! call before it next checks state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::wait::{futex_wait, futex_wake};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AgentState {
    Init = 0,
    Running = 1,
    PauseRequested = 2,
    Paused = 3,
    StopRequested = 4,
    Stopped = 5,
}

impl AgentState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => AgentState::Init,
            1 => AgentState::Running,
            2 => AgentState::PauseRequested,
            3 => AgentState::Paused,
            4 => AgentState::StopRequested,
            _ => AgentState::Stopped,
        }
    }
}

/// Owned by the `NvWal` instance, shared (via `Arc`) with the agent thread.
pub struct AgentStateHandle {
    word: AtomicU32,
}

impl AgentStateHandle {
    pub fn new() -> Self {
        Self { word: AtomicU32::new(AgentState::Init as u32) }
    }

    pub fn get(&self) -> AgentState {
        AgentState::from_u32(self.word.load(Ordering::Acquire))
    }

    fn set(&self, state: AgentState) {
        self.word.store(state as u32, Ordering::Release);
        let _ = futex_wake(&self.word);
    }

    /// Called once by the agent thread itself after spinning up.
    pub fn mark_running(&self) {
        self.set(AgentState::Running);
    }

    /// Caller-side: request the agent pause, and block until it acks.
    pub fn request_pause_and_wait(&self) {
        self.set(AgentState::PauseRequested);
        self.wait_for(AgentState::Paused);
    }

    /// Caller-side: resume a paused agent.
    pub fn resume(&self) {
        self.set(AgentState::Running);
    }

    /// Caller-side: request the agent stop, and block until it acks.
    pub fn request_stop_and_wait(&self) {
        self.set(AgentState::StopRequested);
        self.wait_for(AgentState::Stopped);
    }

    fn wait_for(&self, target: AgentState) {
        loop {
            let seen = self.word.load(Ordering::Acquire);
            if AgentState::from_u32(seen) == target {
                return;
            }
            let _ = futex_wait(&self.word, seen, Some(Duration::from_millis(5)));
        }
    }

    /// Agent-side: observed at the top of the loop. Handles the
    /// pause/resume handshake itself and returns `false` once the agent
    /// should exit.
    pub fn poll(&self) -> bool {
        loop {
            match self.get() {
                AgentState::StopRequested => {
                    self.word.store(AgentState::Stopped as u32, Ordering::Release);
                    let _ = futex_wake(&self.word);
                    return false;
                }
                AgentState::PauseRequested => {
                    self.word.store(AgentState::Paused as u32, Ordering::Release);
                    let _ = futex_wake(&self.word);
                    self.wait_for(AgentState::Running);
                }
                _ => return true,
            }
        }
    }
}

impl Default for AgentStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

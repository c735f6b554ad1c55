//! Virtual audio sinks, one per user, managed through `pactl`.
//!
//! Null sinks work on both PulseAudio and PipeWire (via pipewire-pulse).

use crate::util::exec;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

const PACTL: &str = "pactl";
const NULL_SINK_MODULE: &str = "module-null-sink";

pub struct AudioSinkAllocator {
    enabled: bool,
    program: String,
    /// sink name -> module index reported by `load-module`
    modules: Mutex<HashMap<String, Option<u32>>>,
}

impl AudioSinkAllocator {
    pub fn new(enabled: bool) -> Self {
        Self::with_program(enabled, PACTL)
    }

    pub fn with_program(enabled: bool, program: impl Into<String>) -> Self {
        Self {
            enabled,
            program: program.into(),
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Unload stale null sinks left behind by a previous run.
    pub async fn cleanup(&self) {
        if !self.enabled {
            return;
        }
        match exec(&self.program, &["unload-module", NULL_SINK_MODULE]).await {
            Ok(out) if out.success() => info!("Unloaded stale audio sinks"),
            Ok(out) => info!(code = ?out.code, "No stale audio sinks to unload"),
            Err(e) => warn!(error = %e, "Audio cleanup failed"),
        }
    }

    /// Create a null sink named `id`. Returns the sink name to select.
    pub async fn allocate(&self, id: &str) -> std::io::Result<String> {
        if !self.enabled {
            return Ok(id.to_string());
        }
        let sink_arg = format!("sink_name={}", id);
        let out = exec(&self.program, &["load-module", NULL_SINK_MODULE, &sink_arg]).await?;
        if !out.success() {
            warn!(sink = id, code = ?out.code, "Audio sink allocation failed");
        }
        let index = out.stdout.trim().parse::<u32>().ok();
        self.modules.lock().await.insert(id.to_string(), index);
        info!(sink = id, module = ?index, "Allocated audio sink");
        Ok(id.to_string())
    }

    /// Unload the sink created for `id`, if we know its module index.
    pub async fn release(&self, id: &str) {
        if !self.enabled {
            return;
        }
        let entry = self.modules.lock().await.remove(id);
        let Some(Some(index)) = entry else {
            return;
        };
        let index = index.to_string();
        match exec(&self.program, &["unload-module", &index]).await {
            Ok(_) => info!(sink = id, module = %index, "Released audio sink"),
            Err(e) => warn!(sink = id, error = %e, "Audio sink release failed"),
        }
    }

    pub async fn is_leased(&self, id: &str) -> bool {
        self.modules.lock().await.contains_key(id)
    }
}

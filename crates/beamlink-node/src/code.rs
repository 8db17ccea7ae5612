//! Code loading on the peer through its `code` server.

use std::path::Path;
use std::time::Duration;

use beamlink_protocol::Term;

use crate::config::{CodeSection, PathPosition};
use crate::rpc::{RpcClient, RpcError};

/// Manages the peer's code path and loads compiled modules into it.
#[derive(Debug, Clone)]
pub struct CodeManager {
    rpc: RpcClient,
}

impl CodeManager {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// Poll `erlang:whereis(code_server)` until it returns a pid.
    pub async fn wait_for_code_server(&self, tries: u32, interval: Duration) -> bool {
        for attempt in 1..=tries.max(1) {
            match self
                .rpc
                .call("erlang", "whereis", vec![Term::atom("code_server")])
                .await
            {
                Ok(Term::Pid(pid)) => {
                    tracing::debug!(pid = %pid, attempt, "code: code server running");
                    return true;
                }
                Ok(other) => tracing::trace!(reply = %other, attempt, "code: code server not up yet"),
                Err(e) => {
                    tracing::warn!(error = %e, "code: code server check failed");
                    return false;
                }
            }
            tokio::time::sleep(interval).await;
        }
        tracing::error!(peer = %self.rpc.peer(), "code: code server did not start in time");
        false
    }

    /// Add a directory to the peer's code path.
    pub async fn add_path(&self, position: PathPosition, path: &str) -> Result<(), RpcError> {
        let function = match position {
            PathPosition::A => "add_patha",
            PathPosition::Z => "add_pathz",
        };
        let reply = self
            .rpc
            .call("code", function, vec![Term::charlist(path)])
            .await?;
        if reply.is_atom("true") {
            tracing::debug!(path, function, "code: path added");
            Ok(())
        } else {
            Err(RpcError::Remote(error_reason(reply)))
        }
    }

    /// Remove a directory from the peer's code path. Returns false if it
    /// was not there.
    pub async fn remove_path(&self, path: &str) -> Result<bool, RpcError> {
        let reply = self
            .rpc
            .call("code", "del_path", vec![Term::charlist(path)])
            .await?;
        match reply {
            Term::Atom(ref a) if a.as_str() == "true" => Ok(true),
            Term::Atom(ref a) if a.as_str() == "false" => Ok(false),
            other => Err(RpcError::Remote(error_reason(other))),
        }
    }

    /// Load one compiled module from its object code.
    pub async fn load_beam(&self, module: &str, beam: Vec<u8>) -> Result<(), RpcError> {
        let filename = format!("{module}.beam");
        let reply = self
            .rpc
            .call(
                "code",
                "load_binary",
                vec![Term::atom(module), Term::charlist(&filename), Term::binary(beam)],
            )
            .await?;
        match reply.tagged("module", 2) {
            Some(_) => {
                tracing::debug!(module, "code: module loaded");
                Ok(())
            }
            None => Err(RpcError::Remote(error_reason(reply))),
        }
    }

    /// Load every `.beam` file in `dir`. Modules that fail are logged and
    /// skipped; returns how many loaded.
    pub async fn load_beams_from_dir(&self, dir: &Path) -> Result<usize, RpcError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| RpcError::Backend(e.into()))?;
        let mut loaded = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RpcError::Backend(e.into()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("beam") {
                continue;
            }
            let Some(module) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let beam = match tokio::fs::read(&path).await {
                Ok(beam) => beam,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "code: unreadable beam file");
                    continue;
                }
            };
            match self.load_beam(&module, beam).await {
                Ok(()) => loaded += 1,
                Err(RpcError::Remote(reason)) => {
                    tracing::error!(module, reason = %reason, "code: could not load module");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    /// Apply the configured load paths, in order.
    pub async fn apply_config(&self, code: &CodeSection) -> Result<(), RpcError> {
        for entry in &code.load_paths {
            let path = crate::expand_tilde(&entry.path);
            self.add_path(entry.position, &path.to_string_lossy()).await?;
        }
        Ok(())
    }
}

/// `{error, Reason}` to `Reason`; anything else unchanged.
fn error_reason(reply: Term) -> Term {
    match reply {
        Term::Tuple(mut elems) if elems.len() == 2 && elems[0].is_atom("error") => elems.remove(1),
        other => other,
    }
}

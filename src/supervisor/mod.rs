//! Supervision of the external NBD helper processes (`qemu-img`,
//! `qemu-nbd`, `nbdinfo`, `nbdkit`) that implement disk backup/restore.
//!
//! The supervisor owns nothing long-lived: each operation builds an
//! argument vector, runs the launch protocol and hands back a
//! [`launcher::ProcessHandle`]. Backgrounding servers keep running on
//! their own after the call returns; the handle's PID (pid-file resolved
//! for forking helpers) is the only trace the caller needs.

pub mod command;
pub mod error;
pub mod launcher;

use std::path::Path;

use serde_json::Value;
use tracing::Instrument;

use crate::config::SupervisorConfig;
use command::PluginHostParams;
use error::SupervisorError;
use launcher::{LaunchRequest, ProcessHandle};

/// Helper process supervisor, bound to one NBD export name.
///
/// Holds an instance-scoped tracing span so every event emitted during a
/// launch carries the export it belongs to; concurrent supervisors (one
/// per disk) stay distinguishable in the logs.
pub struct Supervisor {
    export_name: String,
    config: SupervisorConfig,
    span: tracing::Span,
}

impl Supervisor {
    pub fn new(export_name: &str) -> Self {
        Self::with_config(export_name, SupervisorConfig::default())
    }

    pub fn with_config(export_name: &str, config: SupervisorConfig) -> Self {
        let span = tracing::info_span!("nbd_helper", export = %export_name);
        Self {
            export_name: export_name.to_string(),
            config,
            span,
        }
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    /// Run the launch protocol for an arbitrary helper invocation.
    ///
    /// One blocking call per helper: spawn, wait out the configured bound,
    /// classify the exit, recover diagnostics on failure. No retries —
    /// retry policy belongs to the orchestration layer.
    pub async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle, SupervisorError> {
        launcher::run(request, self.config.wait_timeout())
            .instrument(self.span.clone())
            .await
    }

    /// Read the extent map of an NBD export via `nbdinfo`.
    ///
    /// The tool's stdout is returned as parsed JSON with no field
    /// transformation. Unparsable output from a cleanly exited process is
    /// a [`SupervisorError::Decode`], not a process failure.
    pub async fn map_extents(
        &self,
        uri: &str,
        meta_context: Option<&str>,
    ) -> Result<Value, SupervisorError> {
        let cmd = command::map_extents(uri, meta_context);
        let program = cmd.program.clone();
        let handle = self.launch(LaunchRequest::piped(cmd)).await?;
        parse_extent_map(&program, handle.stdout.as_deref().unwrap_or_default())
    }

    /// Create the target disk image with `qemu-img`.
    pub async fn create_image(
        &self,
        disk_format: &str,
        target_file: &Path,
        file_size: u64,
    ) -> Result<ProcessHandle, SupervisorError> {
        let cmd = command::create_image(disk_format, target_file, file_size);
        self.launch(LaunchRequest::logged(cmd)).await
    }

    /// Start the qemu-nbd restore server. The helper forks once its
    /// listening socket is ready; a successful return means that handshake
    /// completed, not merely that a process was spawned. Pass `pid_file`
    /// to have the backgrounded PID resolved into the handle.
    pub async fn start_restore_server(
        &self,
        target_file: &Path,
        socket_file: &Path,
        pid_file: Option<&Path>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let cmd = command::restore_server(&self.export_name, target_file, socket_file, pid_file);
        let mut request = LaunchRequest::logged(cmd);
        if let Some(path) = pid_file {
            request = request.with_pid_file(path);
        }
        self.launch(request).await
    }

    /// Start the read-only qemu-nbd backup server. The spawned process
    /// exits once the fork completes, so the handle's PID always comes
    /// from the deterministic `<socket>.pid` file.
    pub async fn start_backup_server(
        &self,
        disk_format: &str,
        disk_file: &Path,
        socket_file: &Path,
        bitmap: Option<&str>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let pid_file = command::backup_pid_file(socket_file);
        let cmd =
            command::backup_server(&self.export_name, disk_format, disk_file, socket_file, bitmap);
        self.launch(LaunchRequest::logged(cmd).with_pid_file(pid_file))
            .await
    }

    /// Start the nbdkit plugin host. Allocates the private pid-file here —
    /// the command builder stays pure — and resolves the host's real PID
    /// from it, since the host runs until the caller terminates it.
    pub async fn start_plugin_host(
        &self,
        params: &PluginHostParams,
    ) -> Result<ProcessHandle, SupervisorError> {
        let pid_file = launcher::allocate_pid_file()?;
        let cmd = command::plugin_host(&self.export_name, &pid_file, params);
        self.launch(LaunchRequest::logged(cmd).with_pid_file(pid_file))
            .await
    }

    /// Detach an NBD device. A non-zero exit (already detached, for
    /// instance) surfaces qemu-nbd's own diagnostic text.
    pub async fn disconnect(&self, device: &Path) -> Result<ProcessHandle, SupervisorError> {
        tracing::info!("Disconnecting device [{}]", device.display());
        let cmd = command::disconnect(device);
        self.launch(LaunchRequest::logged(cmd)).await
    }
}

fn parse_extent_map(program: &str, raw: &str) -> Result<Value, SupervisorError> {
    serde_json::from_str(raw).map_err(|e| SupervisorError::Decode {
        program: program.to_string(),
        source: e,
    })
}

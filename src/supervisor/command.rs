//! Pure argument-vector builders for the external NBD helper tools.
//!
//! Each builder is total: valid typed inputs always produce a well-formed
//! vector; no I/O, no failure path. The program names and argument
//! conventions of `qemu-img`, `qemu-nbd`, `nbdinfo` and `nbdkit` are
//! load-bearing for compatibility and must not be reworded.

use std::fmt;
use std::path::{Path, PathBuf};

/// A fully-built helper invocation: program plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Typed parameters for the nbdkit plugin host invocation.
#[derive(Debug, Clone)]
pub struct PluginHostParams {
    pub listen_address: String,
    pub listen_port: u16,
    /// Backing python plugin module exposed through nbdkit.
    pub module: PathBuf,
    /// Upper bound on a single read, fed to the blocksize filter.
    pub max_len: u64,
    pub block_map: PathBuf,
    pub disk: PathBuf,
    pub verbose: bool,
    pub threads: u32,
}

/// `qemu-img create -f <fmt> <path> <size>` — size is passed through
/// verbatim; validation belongs to qemu-img itself.
pub fn create_image(disk_format: &str, target_file: &Path, file_size: u64) -> HelperCommand {
    HelperCommand::new(
        "qemu-img",
        vec![
            "create".to_string(),
            "-f".to_string(),
            disk_format.to_string(),
            path_arg(target_file),
            file_size.to_string(),
        ],
    )
}

/// `nbdinfo --json --map[=<context>] <uri>` — read-only extent map
/// introspection. The URI goes in as a plain argv element, never through a
/// shell, so no quoting of it can change what gets executed.
pub fn map_extents(uri: &str, meta_context: Option<&str>) -> HelperCommand {
    let map_opt = match meta_context {
        Some(context) => format!("--map={}", context),
        None => "--map".to_string(),
    };
    HelperCommand::new(
        "nbdinfo",
        vec!["--json".to_string(), map_opt, uri.to_string()],
    )
}

/// `qemu-nbd` restore server: always a qcow2 target, always forks into the
/// background once its listening socket is ready. Pass `pid_file` when the
/// backgrounded PID must be resolvable after the visible process exits.
pub fn restore_server(
    export_name: &str,
    target_file: &Path,
    socket_file: &Path,
    pid_file: Option<&Path>,
) -> HelperCommand {
    let mut args = vec![
        "--discard=unmap".to_string(),
        "--format=qcow2".to_string(),
        "-x".to_string(),
        export_name.to_string(),
        path_arg(target_file),
        "-k".to_string(),
        path_arg(socket_file),
        "--fork".to_string(),
    ];
    if let Some(path) = pid_file {
        args.push(format!("--pid-file={}", path.display()));
    }
    HelperCommand::new("qemu-nbd", args)
}

/// Pid-file path for the backup server: deterministic `<socket>.pid`,
/// written by qemu-nbd itself once the fork completes.
pub fn backup_pid_file(socket_file: &Path) -> PathBuf {
    let mut path = socket_file.as_os_str().to_os_string();
    path.push(".pid");
    PathBuf::from(path)
}

/// `qemu-nbd` backup server: read-only export with an optional differential
/// bitmap. When no bitmap is given the bitmap flag is omitted entirely and
/// the `--` terminator takes its place — an empty `--bitmap=` is invalid.
pub fn backup_server(
    export_name: &str,
    disk_format: &str,
    disk_file: &Path,
    socket_file: &Path,
    bitmap: Option<&str>,
) -> HelperCommand {
    let bitmap_opt = match bitmap {
        Some(name) => format!("--bitmap={}", name),
        None => "--".to_string(),
    };
    HelperCommand::new(
        "qemu-nbd",
        vec![
            "-r".to_string(),
            format!("--format={}", disk_format),
            "-x".to_string(),
            export_name.to_string(),
            path_arg(disk_file),
            "-k".to_string(),
            path_arg(socket_file),
            "-t".to_string(),
            "-e".to_string(),
            "2".to_string(),
            "--fork".to_string(),
            "--detect-zeroes=on".to_string(),
            format!("--pid-file={}", backup_pid_file(socket_file).display()),
            bitmap_opt,
        ],
    )
}

/// `nbdkit` plugin host: listener, export, blocksize+cow filter chain, the
/// backing python module and its free-form parameters. The pid-file is
/// allocated by the caller (the builder performs no I/O) and handed in.
pub fn plugin_host(
    export_name: &str,
    pid_file: &Path,
    params: &PluginHostParams,
) -> HelperCommand {
    let debug = if params.verbose { "1" } else { "0" };
    HelperCommand::new(
        "nbdkit",
        vec![
            "--pidfile".to_string(),
            path_arg(pid_file),
            "-i".to_string(),
            params.listen_address.clone(),
            "-p".to_string(),
            params.listen_port.to_string(),
            "-e".to_string(),
            export_name.to_string(),
            "--filter=blocksize".to_string(),
            "--filter=cow".to_string(),
            "-v".to_string(),
            "python".to_string(),
            path_arg(&params.module),
            format!("maxlen={}", params.max_len),
            format!("blockmap={}", params.block_map.display()),
            format!("disk={}", params.disk.display()),
            format!("debug={}", debug),
            "-t".to_string(),
            params.threads.to_string(),
        ],
    )
}

/// `qemu-nbd -d <device>` — detach a named device path.
pub fn disconnect(device: &Path) -> HelperCommand {
    HelperCommand::new("qemu-nbd", vec!["-d".to_string(), path_arg(device)])
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> PluginHostParams {
        PluginHostParams {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 10809,
            module: PathBuf::from("/opt/nbdbak/plugin.py"),
            max_len: 4096,
            block_map: PathBuf::from("/tmp/blockmap.json"),
            disk: PathBuf::from("/var/lib/backup/sda.full.data"),
            verbose: false,
            threads: 1,
        }
    }

    #[test]
    fn create_image_args() {
        let cmd = create_image("qcow2", Path::new("/tmp/target.qcow2"), 10737418240);
        assert_eq!(cmd.program, "qemu-img");
        assert_eq!(
            cmd.args,
            vec!["create", "-f", "qcow2", "/tmp/target.qcow2", "10737418240"]
        );
    }

    #[test]
    fn map_extents_default_context() {
        let cmd = map_extents("nbd+unix:///sda?socket=/tmp/s.sock", None);
        assert_eq!(cmd.program, "nbdinfo");
        assert_eq!(
            cmd.args,
            vec!["--json", "--map", "nbd+unix:///sda?socket=/tmp/s.sock"]
        );
    }

    #[test]
    fn map_extents_named_context() {
        let cmd = map_extents("nbd+unix:///sda?socket=/tmp/s.sock", Some("qemu:dirty-bitmap:bitmap0"));
        assert_eq!(cmd.args[1], "--map=qemu:dirty-bitmap:bitmap0");
    }

    #[test]
    fn restore_server_args() {
        let cmd = restore_server("sda", Path::new("/tmp/restore.qcow2"), Path::new("/tmp/r.sock"), None);
        assert_eq!(cmd.program, "qemu-nbd");
        assert_eq!(
            cmd.args,
            vec![
                "--discard=unmap",
                "--format=qcow2",
                "-x",
                "sda",
                "/tmp/restore.qcow2",
                "-k",
                "/tmp/r.sock",
                "--fork",
            ]
        );
    }

    #[test]
    fn restore_server_optional_pid_file() {
        let cmd = restore_server(
            "sda",
            Path::new("/tmp/restore.qcow2"),
            Path::new("/tmp/r.sock"),
            Some(Path::new("/tmp/r.sock.pid")),
        );
        assert_eq!(cmd.args.last().unwrap(), "--pid-file=/tmp/r.sock.pid");
    }

    #[test]
    fn backup_server_with_bitmap() {
        let cmd = backup_server("sda", "qcow2", Path::new("/vm/sda.qcow2"), Path::new("/tmp/b.sock"), Some("backup-sda"));
        assert_eq!(
            cmd.args,
            vec![
                "-r",
                "--format=qcow2",
                "-x",
                "sda",
                "/vm/sda.qcow2",
                "-k",
                "/tmp/b.sock",
                "-t",
                "-e",
                "2",
                "--fork",
                "--detect-zeroes=on",
                "--pid-file=/tmp/b.sock.pid",
                "--bitmap=backup-sda",
            ]
        );
    }

    #[test]
    fn backup_server_without_bitmap_uses_terminator() {
        let cmd = backup_server("sda", "raw", Path::new("/vm/sda.img"), Path::new("/tmp/b.sock"), None);
        assert_eq!(cmd.args.last().unwrap(), "--");
        // 비트맵 미지정 시 --bitmap= 토큰이 아예 없어야 함
        assert!(!cmd.args.iter().any(|a| a.starts_with("--bitmap")));
    }

    #[test]
    fn backup_pid_file_is_deterministic() {
        assert_eq!(
            backup_pid_file(Path::new("/tmp/b.sock")),
            PathBuf::from("/tmp/b.sock.pid")
        );
    }

    #[test]
    fn plugin_host_args() {
        let cmd = plugin_host("vmmap", Path::new("/tmp/nbdkit123.pid"), &sample_params());
        assert_eq!(cmd.program, "nbdkit");
        assert_eq!(
            cmd.args,
            vec![
                "--pidfile",
                "/tmp/nbdkit123.pid",
                "-i",
                "127.0.0.1",
                "-p",
                "10809",
                "-e",
                "vmmap",
                "--filter=blocksize",
                "--filter=cow",
                "-v",
                "python",
                "/opt/nbdbak/plugin.py",
                "maxlen=4096",
                "blockmap=/tmp/blockmap.json",
                "disk=/var/lib/backup/sda.full.data",
                "debug=0",
                "-t",
                "1",
            ]
        );
    }

    #[test]
    fn plugin_host_debug_follows_verbosity() {
        let mut params = sample_params();
        params.verbose = true;
        let cmd = plugin_host("vmmap", Path::new("/tmp/p.pid"), &params);
        assert!(cmd.args.contains(&"debug=1".to_string()));
    }

    #[test]
    fn disconnect_args() {
        let cmd = disconnect(Path::new("/dev/nbd0"));
        assert_eq!(cmd.program, "qemu-nbd");
        assert_eq!(cmd.args, vec!["-d", "/dev/nbd0"]);
    }

    #[test]
    fn builders_emit_no_empty_tokens() {
        let commands = vec![
            create_image("qcow2", Path::new("/t.qcow2"), 1),
            map_extents("nbd://h", None),
            map_extents("nbd://h", Some("base:allocation")),
            restore_server("e", Path::new("/t"), Path::new("/s"), None),
            backup_server("e", "qcow2", Path::new("/d"), Path::new("/s"), None),
            backup_server("e", "qcow2", Path::new("/d"), Path::new("/s"), Some("bm")),
            plugin_host("e", Path::new("/p.pid"), &sample_params()),
            disconnect(Path::new("/dev/nbd0")),
        ];
        for cmd in commands {
            assert!(!cmd.program.is_empty());
            assert!(
                cmd.args.iter().all(|a| !a.trim().is_empty()),
                "empty token in {}",
                cmd
            );
        }
    }

    #[test]
    fn builders_are_deterministic() {
        let a = backup_server("e", "qcow2", Path::new("/d"), Path::new("/s"), Some("bm"));
        let b = backup_server("e", "qcow2", Path::new("/d"), Path::new("/s"), Some("bm"));
        assert_eq!(a, b);
    }
}

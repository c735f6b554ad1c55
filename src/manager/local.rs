//! Sessions backed by local processes: the hooked target app plus its
//! companion streamer, handed off through the hook's rendezvous socket.

use super::instance::{ApplicationInstance, OutputStreams, ProcessSupervisor};
use super::launch::{
    app_command, streamer_command, AppLaunch, CommandLine, SessionDirs, StreamerLaunch,
};
use super::readiness::{handoff, PollPolicy};
use super::SessionBackend;
use crate::audio::AudioSinkAllocator;
use crate::config::{AppSpec, ManagementOptions, User};
use crate::error::{Error, Result};
use crate::util::exists;
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const STREAM_BUFFER: usize = 256;
const READ_CHUNK: usize = 8192;

pub const STREAM_STDOUT: &str = "stdout";
pub const STREAM_STDERR: &str = "stderr";
pub const STREAM_STREAMER_STDOUT: &str = "streamer_stdout";
pub const STREAM_STREAMER_STDERR: &str = "streamer_stderr";

pub struct LocalBackend {
    opts: Arc<ManagementOptions>,
    audio: Arc<AudioSinkAllocator>,
    forced_kills: Arc<AtomicU64>,
}

impl LocalBackend {
    pub fn new(opts: ManagementOptions) -> Self {
        let audio = AudioSinkAllocator::new(!opts.disable_audio_support);
        Self::with_audio(opts, audio)
    }

    pub fn with_audio(opts: ManagementOptions, audio: AudioSinkAllocator) -> Self {
        Self {
            opts: Arc::new(opts),
            audio: Arc::new(audio),
            forced_kills: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of sessions that had to be SIGKILLed after a stop request.
    pub fn forced_kills(&self) -> u64 {
        self.forced_kills.load(Ordering::SeqCst)
    }

    /// Warn about every missing hook library. Returns true if all exist.
    pub async fn check_hooks(&self) -> bool {
        let mut ok = true;
        for library in self.opts.hook_libraries() {
            if !exists(&library).await {
                warn!(
                    library = %library.display(),
                    "Hyperwarp hook not found, build it first with `make`"
                );
                ok = false;
            }
        }
        if ok {
            info!("Hyperwarp hooks found");
        }
        ok
    }
}

#[async_trait]
impl SessionBackend for LocalBackend {
    async fn start(&self) {
        if !self.opts.disable_startup_audio_cleanup {
            self.audio.cleanup().await;
        }
        self.check_hooks().await;
    }

    fn create_supervisor(
        &self,
        _user: &User,
        _app_spec: &AppSpec,
        _sid: &str,
    ) -> Box<dyn ProcessSupervisor> {
        Box::new(LocalApplication::new(
            self.opts.clone(),
            self.audio.clone(),
            self.forced_kills.clone(),
        ))
    }
}

#[derive(Clone, Copy)]
enum Mirror {
    Off,
    Stdout,
    Stderr,
}

/// State shared between the supervisor and its background tasks.
struct Shared {
    opts: Arc<ManagementOptions>,
    audio: Arc<AudioSinkAllocator>,
    forced_kills: Arc<AtomicU64>,
    outputs: OutputStreams,
    app_pid: Mutex<Option<u32>>,
    streamer_pid: Mutex<Option<u32>>,
    force_kill: Mutex<Option<JoinHandle<()>>>,
    audio_sink: Mutex<Option<String>>,
    socket: Mutex<Option<PathBuf>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn output(&self, name: &str) -> broadcast::Sender<Bytes> {
        match self.outputs.get(name) {
            Some(tx) => tx.clone(),
            None => broadcast::channel(1).0,
        }
    }

    fn mirror(&self, stderr: bool) -> Mirror {
        match (self.opts.verbose, stderr) {
            (false, _) => Mirror::Off,
            (true, false) => Mirror::Stdout,
            (true, true) => Mirror::Stderr,
        }
    }

    /// Forget the target process and disarm any pending forced kill.
    fn clear_app(&self) {
        lock(&self.app_pid).take();
        if let Some(task) = lock(&self.force_kill).take() {
            task.abort();
        }
    }
}

pub struct LocalApplication {
    shared: Arc<Shared>,
}

impl LocalApplication {
    fn new(
        opts: Arc<ManagementOptions>,
        audio: Arc<AudioSinkAllocator>,
        forced_kills: Arc<AtomicU64>,
    ) -> Self {
        let outputs = [STREAM_STDOUT, STREAM_STDERR, STREAM_STREAMER_STDOUT, STREAM_STREAMER_STDERR]
            .into_iter()
            .map(|name| (name.to_string(), broadcast::channel(STREAM_BUFFER).0))
            .collect();
        Self {
            shared: Arc::new(Shared {
                opts,
                audio,
                forced_kills,
                outputs,
                app_pid: Mutex::new(None),
                streamer_pid: Mutex::new(None),
                force_kill: Mutex::new(None),
                audio_sink: Mutex::new(None),
                socket: Mutex::new(None),
            }),
        }
    }
}

fn spawn_command(command: &CommandLine, cwd: Option<&Path>) -> Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.spawn().map_err(|source| Error::Spawn {
        binary: command.program.clone(),
        source,
    })
}

fn describe(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        _ => "unknown status".to_string(),
    }
}

fn send_signal(pid: u32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, signal = ?signal, error = %e, "Failed to signal process");
            false
        }
    }
}

/// Copy a child stream into its log file and to relay subscribers.
async fn pump<R>(mut reader: R, log_path: PathBuf, tx: broadcast::Sender<Bytes>, mirror: Mirror)
where
    R: AsyncRead + Unpin,
{
    let mut file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %log_path.display(), error = %e, "Cannot open log file");
            None
        }
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(path = %log_path.display(), error = %e, "Stream read failed");
                break;
            }
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&chunk).await {
                warn!(path = %log_path.display(), error = %e, "Log write failed");
                file = None;
            }
        }
        let _ = match mirror {
            Mirror::Off => Ok(()),
            Mirror::Stdout => tokio::io::stdout().write_all(&chunk).await,
            Mirror::Stderr => tokio::io::stderr().write_all(&chunk).await,
        };
        // No subscribers is fine.
        let _ = tx.send(chunk);
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

fn attach_pumps(shared: &Shared, child: &mut Child, dirs: &SessionDirs, sid: &str, streamer: bool) {
    let (out_name, err_name, out_log, err_log) = if streamer {
        (STREAM_STREAMER_STDOUT, STREAM_STREAMER_STDERR, "streamer-stdout", "streamer-stderr")
    } else {
        (STREAM_STDOUT, STREAM_STDERR, "stdout", "stderr")
    };
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(
            stdout,
            dirs.log_file(sid, out_log),
            shared.output(out_name),
            shared.mirror(false),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(
            stderr,
            dirs.log_file(sid, err_log),
            shared.output(err_name),
            shared.mirror(true),
        ));
    }
}

async fn spawn_streamerd(
    shared: Arc<Shared>,
    instance: Arc<ApplicationInstance>,
    dirs: SessionDirs,
    socket: PathBuf,
) {
    if instance.is_stopped() {
        return;
    }
    let launch = StreamerLaunch {
        sid: &instance.sid,
        user_id: &instance.user.id,
        secret: instance.secret(),
        socket: &socket,
        dirs: &dirs,
    };
    let command = streamer_command(&launch, &shared.opts);
    let mut child = match spawn_command(&command, None) {
        Ok(child) => child,
        Err(e) => {
            warn!(sid = %instance.sid, error = %e, "Streamer failed to start");
            return;
        }
    };
    *lock(&shared.streamer_pid) = child.id();
    info!(sid = %instance.sid, pid = ?child.id(), program = %command.program, "Streamer started");
    attach_pumps(&shared, &mut child, &dirs, &instance.sid, true);

    // The streamer's exit is only logged; the app's exit ends the session.
    let sid = instance.sid.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(sid = %sid, status = %describe(&status), "Streamer exited"),
            Err(e) => warn!(sid = %sid, error = %e, "Waiting on streamer failed"),
        }
        lock(&shared.streamer_pid).take();
    });
}

#[async_trait]
impl ProcessSupervisor for LocalApplication {
    async fn start(&self, instance: &Arc<ApplicationInstance>) -> Result<()> {
        let shared = &self.shared;
        let opts = &shared.opts;
        let sid = &instance.sid;

        let dirs = SessionDirs::new(&opts.userdata_root(), &instance.user.id);
        dirs.create().await?;

        // One sink per user, keyed by user id.
        let audio_sink = if shared.audio.enabled() {
            let sink = shared.audio.allocate(&instance.user.id).await?;
            *lock(&shared.audio_sink) = Some(sink.clone());
            Some(sink)
        } else {
            None
        };

        tokio::fs::create_dir_all(&opts.socket_dir).await?;
        let socket = opts.socket_path(sid);
        if exists(&socket).await {
            let _ = tokio::fs::remove_file(&socket).await;
        }
        *lock(&shared.socket) = Some(socket.clone());

        let launch = AppLaunch {
            user: &instance.user,
            app_spec: &instance.app_spec,
            sid,
            dirs: &dirs,
            audio_sink: audio_sink.as_deref(),
            socket: &socket,
        };
        let command = app_command(&launch, opts);
        let mut child = spawn_command(&command, Some(&dirs.root))?;
        *lock(&shared.app_pid) = child.id();
        info!(sid = %sid, pid = ?child.id(), program = %command.program, "Application started");

        attach_pumps(shared, &mut child, &dirs, sid, false);

        // Any exit, planned or not, ends the session.
        {
            let shared = shared.clone();
            let instance = instance.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        let status = describe(&status);
                        info!(sid = %instance.sid, %status, "Application exited")
                    }
                    Err(e) => {
                        warn!(sid = %instance.sid, error = %e, "Waiting on application failed")
                    }
                }
                shared.clear_app();
                instance.stop().await;
            });
        }

        if opts.streamer.enabled {
            let policy = PollPolicy {
                interval: Duration::from_millis(opts.poll_interval_ms),
                attempts: opts.poll_attempts,
            };
            let shared = shared.clone();
            let instance = instance.clone();
            tokio::spawn(async move {
                let stop = instance.stop_signal();
                let rendezvous = socket.clone();
                handoff(&rendezvous, policy, stop, || {
                    spawn_streamerd(shared, instance, dirs, socket)
                })
                .await;
            });
        }
        Ok(())
    }

    async fn stop(&self, instance: &ApplicationInstance) {
        let shared = &self.shared;
        // Only reached with a live app when start failed halfway.
        let app_pid = *lock(&shared.app_pid);
        if let Some(pid) = app_pid {
            send_signal(pid, Signal::SIGTERM);
        }
        let streamer_pid = *lock(&shared.streamer_pid);
        if let Some(pid) = streamer_pid {
            info!(sid = %instance.sid, pid, "Stopping streamer");
            send_signal(pid, Signal::SIGTERM);
        }
        let sink = lock(&shared.audio_sink).take();
        if let Some(sink) = sink {
            shared.audio.release(&sink).await;
        }
        let socket = lock(&shared.socket).take();
        if let Some(socket) = socket {
            let _ = tokio::fs::remove_file(socket).await;
        }
    }

    async fn request_stop(&self, instance: &ApplicationInstance) {
        let shared = &self.shared;
        let app_pid = *lock(&shared.app_pid);
        let Some(pid) = app_pid else {
            return;
        };
        info!(sid = %instance.sid, pid, "Requesting application exit");
        send_signal(pid, Signal::SIGTERM);

        let timeout = Duration::from_millis(shared.opts.proc_exit_request_timeout_ms);
        let task = {
            let shared = shared.clone();
            let sid = instance.sid.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let pid = *lock(&shared.app_pid);
                if let Some(pid) = pid {
                    warn!(sid = %sid, pid, "Process did not exit in time, sending SIGKILL");
                    if send_signal(pid, Signal::SIGKILL) {
                        shared.forced_kills.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };
        if let Some(previous) = lock(&shared.force_kill).replace(task) {
            previous.abort();
        }
    }

    fn streams(&self) -> OutputStreams {
        if lock(&self.shared.app_pid).is_none() {
            return OutputStreams::new();
        }
        self.shared.outputs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSpec;
    use crate::manager::instance::tests::user;
    use crate::manager::{Manager, ManagerEvent};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    struct Harness {
        dir: TempDir,
        backend: Arc<LocalBackend>,
        manager: Arc<Manager>,
    }

    fn options(dir: &Path) -> ManagementOptions {
        let mut opts = ManagementOptions::default();
        opts.disable_audio_support = true;
        opts.hyperwarp_path = dir.join("hyperwarp");
        opts.userdata_path = Some(dir.join("userdata"));
        opts.socket_dir = dir.join("sockets");
        opts.poll_interval_ms = 50;
        opts.poll_attempts = 40;
        opts.proc_exit_request_timeout_ms = 300;
        opts.streamer.enabled = false;
        opts
    }

    fn harness(configure: impl FnOnce(&Path, &mut ManagementOptions)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        configure(dir.path(), &mut opts);
        let backend = Arc::new(LocalBackend::new(opts));
        let manager = Manager::new(backend.clone());
        Harness { dir, backend, manager }
    }

    fn shell_app(script: &str) -> AppSpec {
        AppSpec {
            id: "sh".into(),
            binary: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: [("GREETING".to_string(), "hello".to_string())].into(),
            rewrite_home: true,
            rewrite_data_dirs: true,
            display_name: "Shell".into(),
            description: String::new(),
            poster: String::new(),
        }
    }

    async fn wait_deleted(
        manager: &Manager,
        rx: &mut broadcast::Receiver<ManagerEvent>,
        sid: &str,
    ) {
        timeout(Duration::from_secs(10), async {
            loop {
                if manager.get_session(sid).await.is_none() {
                    return;
                }
                if let Ok(ManagerEvent::Deleted(id)) = rx.recv().await {
                    if id == sid {
                        return;
                    }
                }
            }
        })
        .await
        .expect("session was not deleted in time");
    }

    async fn wait_for_file(path: &Path, needle: &str) -> String {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(contents) = tokio::fs::read_to_string(path).await {
                    if contents.contains(needle) {
                        return contents;
                    }
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never contained {:?}", path.display(), needle))
    }

    #[tokio::test]
    async fn exit_stops_session_and_logs_output() {
        let h = harness(|_, _| {});
        let mut rx = h.manager.subscribe();
        let u = user("alice");
        let script = "echo \"$GREETING $HYPERWARP_SESSION_ID $HOME\"; pwd; echo oops >&2";
        let sid = h.manager.launch_for_user(&u, &shell_app(script)).await.unwrap();

        wait_deleted(&h.manager, &mut rx, &sid).await;
        assert!(h.manager.session_for_user("alice").await.is_none());

        let logs = h.dir.path().join("userdata/alice/logfiles");
        let home = h.dir.path().join("userdata/alice/home");
        let stdout_log = logs.join(format!("{}-stdout.log", sid));
        let stdout = wait_for_file(&stdout_log, "userdata/alice\n").await;
        assert!(stdout.contains(&format!("hello {} {}", sid, home.display())));
        wait_for_file(&logs.join(format!("{}-stderr.log", sid)), "oops").await;
    }

    #[tokio::test]
    async fn graceful_exit_cancels_forced_kill() {
        let h = harness(|_, _| {});
        let mut rx = h.manager.subscribe();
        let sid = h
            .manager
            .launch_for_user(&user("bob"), &shell_app("exec sleep 30"))
            .await
            .unwrap();
        let inst = h.manager.get_instance(&sid).await.unwrap();
        assert_eq!(inst.streams().len(), 4);

        inst.request_stop().await;
        wait_deleted(&h.manager, &mut rx, &sid).await;
        assert!(inst.streams().is_empty());

        // Past the kill deadline: nothing left to kill, nothing was killed.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(h.backend.forced_kills(), 0);
        inst.request_stop().await;
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_timeout() {
        let h = harness(|_, _| {});
        let mut rx = h.manager.subscribe();
        let sid = h
            .manager
            .launch_for_user(&user("carol"), &shell_app("trap '' TERM; exec sleep 30"))
            .await
            .unwrap();
        let inst = h.manager.get_instance(&sid).await.unwrap();
        // Give sh time to install the trap before we signal it.
        sleep(Duration::from_millis(200)).await;
        inst.request_stop().await;

        sleep(Duration::from_millis(100)).await;
        assert!(h.manager.get_session(&sid).await.is_some());

        wait_deleted(&h.manager, &mut rx, &sid).await;
        assert_eq!(h.backend.forced_kills(), 1);
    }

    #[tokio::test]
    async fn output_is_broadcast_to_subscribers() {
        let h = harness(|_, _| {});
        let sid = h
            .manager
            .launch_for_user(&user("dave"), &shell_app("sleep 0.3; echo ping; exec sleep 30"))
            .await
            .unwrap();
        let inst = h.manager.get_instance(&sid).await.unwrap();
        let mut stdout = inst.streams()[STREAM_STDOUT].subscribe();
        let chunk = timeout(Duration::from_secs(5), stdout.recv()).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"ping\n");
        inst.request_stop().await;
    }

    #[tokio::test]
    async fn streamer_starts_once_socket_appears() {
        let h = harness(|dir, opts| {
            let script = dir.join("streamerd");
            std::fs::write(
                &script,
                "#!/bin/sh\necho \"args: $@\"\necho \"secret: $STREAMERD_SECRET\"\nexec sleep 30\n",
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            opts.streamer.enabled = true;
            opts.streamer.binary = Some(script);
        });
        let mut rx = h.manager.subscribe();
        let script = "sleep 0.2; touch \"$HYPERWARP_SOCKET\"; exec sleep 30";
        let sid = h
            .manager
            .launch_for_user(&user("erin"), &shell_app(script))
            .await
            .unwrap();
        let inst = h.manager.get_instance(&sid).await.unwrap();
        let socket = h.dir.path().join("sockets").join(format!("hyperwarp-{}.sock", sid));

        let log = h
            .dir
            .path()
            .join("userdata/erin/logfiles")
            .join(format!("{}-streamer-stdout.log", sid));
        let contents = wait_for_file(&log, "secret:").await;
        assert!(contents.contains(&format!("args: {} ws ws://", socket.display())));
        assert!(contents.contains(&format!("secret: {}", inst.secret())));

        inst.request_stop().await;
        wait_deleted(&h.manager, &mut rx, &sid).await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let h = harness(|_, _| {});
        let mut app = shell_app("");
        app.binary = h.dir.path().join("does-not-exist").display().to_string();
        let err = h.manager.launch_for_user(&user("frank"), &app).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(h.manager.session_for_user("frank").await.is_none());
        assert!(h.manager.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn hook_check_reports_missing_libraries() {
        let h = harness(|_, _| {});
        assert!(!h.backend.check_hooks().await);

        let opts = options(h.dir.path());
        for library in opts.hook_libraries() {
            std::fs::create_dir_all(library.parent().unwrap()).unwrap();
            std::fs::write(&library, b"").unwrap();
        }
        assert!(h.backend.check_hooks().await);
    }
}

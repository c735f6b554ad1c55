//! Command lines and environments for the target app and the streamer.

use crate::config::{AppSpec, ManagementOptions, Profiler, User, Wrapper};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment changes applied on top of the inherited environment.
pub type EnvLayer = BTreeMap<String, String>;

/// A fully resolved launch: what to exec, with what, and which env changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: EnvLayer,
}

/// Replace whole-argument `%sid%`, `%user%` and `%username%` tokens.
pub fn substitute_args(template: &[String], sid: &str, user: &User) -> Vec<String> {
    template
        .iter()
        .map(|arg| match arg.as_str() {
            "%sid%" => sid.to_string(),
            "%user%" => user.id.clone(),
            "%username%" => user.name.clone(),
            _ => arg.clone(),
        })
        .collect()
}

/// Per-user data directory layout.
#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub root: PathBuf,
}

impl SessionDirs {
    pub fn new(userdata_root: &Path, user_id: &str) -> Self {
        Self {
            root: userdata_root.join(user_id),
        }
    }

    pub fn home(&self) -> PathBuf {
        self.root.join("home")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logfiles")
    }

    pub fn log_file(&self, sid: &str, stream: &str) -> PathBuf {
        self.logs().join(format!("{}-{}.log", sid, stream))
    }

    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.home()).await?;
        tokio::fs::create_dir_all(self.logs()).await
    }
}

pub fn data_dir_env(dirs: &SessionDirs, app_spec: &AppSpec) -> EnvLayer {
    let home = dirs.home();
    let mut env = EnvLayer::new();
    if app_spec.rewrite_home {
        env.insert("HOME".into(), home.display().to_string());
        env.insert("XDG_RUNTIME_DIR".into(), home.display().to_string());
    }
    if app_spec.rewrite_data_dirs {
        let share = home.join(".local").join("share");
        env.insert("XDG_DATA_HOME".into(), share.display().to_string());
        env.insert("XDG_DATA_DIRS".into(), share.display().to_string());
    }
    env
}

pub fn hook_env(sid: &str, user_id: &str, socket: &Path, libraries: &[PathBuf]) -> EnvLayer {
    let preload = libraries
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    EnvLayer::from([
        ("HYPERWARP_SESSION_ID".to_string(), sid.to_string()),
        ("HYPERWARP_USER_ID".to_string(), user_id.to_string()),
        ("HYPERWARP_ENABLED".to_string(), "1".to_string()),
        ("HYPERWARP_SOCKET".to_string(), socket.display().to_string()),
        ("LD_PRELOAD".to_string(), preload),
    ])
}

/// Merge layers in order; later layers win.
pub fn layer_env<'a>(layers: impl IntoIterator<Item = &'a EnvLayer>) -> EnvLayer {
    let mut env = EnvLayer::new();
    for layer in layers {
        env.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    env
}

pub struct AppLaunch<'a> {
    pub user: &'a User,
    pub app_spec: &'a AppSpec,
    pub sid: &'a str,
    pub dirs: &'a SessionDirs,
    pub audio_sink: Option<&'a str>,
    pub socket: &'a Path,
}

/// Command line for the hooked target application.
pub fn app_command(launch: &AppLaunch<'_>, opts: &ManagementOptions) -> CommandLine {
    let audio = launch
        .audio_sink
        .map(|sink| EnvLayer::from([("PULSE_SINK".to_string(), sink.to_string())]))
        .unwrap_or_default();
    let spec_env: EnvLayer = launch.app_spec.env.clone().into_iter().collect();
    let dirs = data_dir_env(launch.dirs, launch.app_spec);
    let hooks = hook_env(launch.sid, &launch.user.id, launch.socket, &opts.hook_libraries());

    let command = CommandLine {
        program: launch.app_spec.binary.clone(),
        args: substitute_args(&launch.app_spec.args, launch.sid, launch.user),
        env: layer_env([&audio, &spec_env, &dirs, &hooks]),
    };
    match &opts.app_wrapper {
        Some(wrapper) => wrap(wrapper, command),
        None => command,
    }
}

/// Run `command` under a diagnostic wrapper. The wrapper must not itself be
/// hooked, so the env changes become literal `env K=V` arguments.
pub fn wrap(wrapper: &Wrapper, command: CommandLine) -> CommandLine {
    let mut args = wrapper.args.clone();
    args.push("env".to_string());
    args.extend(command.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    args.push(command.program);
    args.extend(command.args);
    CommandLine {
        program: wrapper.binary.clone(),
        args,
        env: EnvLayer::new(),
    }
}

pub struct StreamerLaunch<'a> {
    pub sid: &'a str,
    pub user_id: &'a str,
    pub secret: &'a str,
    pub socket: &'a Path,
    pub dirs: &'a SessionDirs,
}

/// Command line for the companion streamer process.
pub fn streamer_command(launch: &StreamerLaunch<'_>, opts: &ManagementOptions) -> CommandLine {
    let streamer = &opts.streamer;
    let mut args = vec![
        launch.socket.display().to_string(),
        streamer.mode.clone(),
        opts.relay_endpoint.clone(),
    ];
    if let Some(encoder) = &streamer.encoder {
        args.push("--encoder".to_string());
        args.push(encoder.clone());
    }
    if streamer.optimize {
        args.push("--optimize".to_string());
    }

    let mut env = EnvLayer::from([
        ("HYPERWARP_SESSION_ID".to_string(), launch.sid.to_string()),
        ("HYPERWARP_USER_ID".to_string(), launch.user_id.to_string()),
        ("STREAMERD_SECRET".to_string(), launch.secret.to_string()),
    ]);
    if opts.debug {
        env.insert("RUST_LOG".into(), "debug".into());
    }
    if streamer.driver_reset_workaround {
        env.insert("STREAMERD_DRIVER_RESET_WORKAROUND".into(), "1".into());
    }

    let command = CommandLine {
        program: opts.streamer_binary().display().to_string(),
        args,
        env,
    };
    match streamer.profiler {
        Some(profiler) => profile(profiler, launch, command),
        None => command,
    }
}

fn profile(profiler: Profiler, launch: &StreamerLaunch<'_>, command: CommandLine) -> CommandLine {
    let (program, mut args) = match profiler {
        Profiler::Flamegraph => {
            let output = launch.dirs.logs().join(format!("{}-flamegraph.svg", launch.sid));
            (
                "flamegraph".to_string(),
                vec!["-o".to_string(), output.display().to_string(), "--".to_string()],
            )
        }
        Profiler::Valgrind => ("valgrind".to_string(), vec!["--leak-check=full".to_string()]),
    };
    args.push(command.program);
    args.extend(command.args);
    CommandLine {
        program,
        args,
        env: command.env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::instance::tests::{app, user};

    #[test]
    fn substitutes_whole_tokens_only() {
        let u = user("alice");
        let args: Vec<String> = ["--sid", "%sid%", "%user%", "%username%", "x%sid%"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            substitute_args(&args, "S1", &u),
            vec!["--sid", "S1", "alice", "alice name", "x%sid%"]
        );
    }

    #[test]
    fn data_dirs_follow_opt_in_flags() {
        let dirs = SessionDirs::new(Path::new("/data"), "alice");
        let mut spec = app("a");
        let env = data_dir_env(&dirs, &spec);
        assert_eq!(env["HOME"], "/data/alice/home");
        assert_eq!(env["XDG_DATA_HOME"], "/data/alice/home/.local/share");

        spec.rewrite_home = false;
        spec.rewrite_data_dirs = false;
        assert!(data_dir_env(&dirs, &spec).is_empty());
    }

    #[test]
    fn later_layers_win() {
        let dirs = SessionDirs::new(Path::new("/data"), "alice");
        let u = user("alice");
        let mut spec = app("a");
        spec.env.insert("HOME".into(), "/spec/home".into());
        spec.env.insert("FOO".into(), "bar".into());
        spec.env.insert("PULSE_SINK".into(), "spec-sink".into());
        spec.args = vec!["%sid%".into()];
        let socket = PathBuf::from("/tmp/hw.sock");
        let launch = AppLaunch {
            user: &u,
            app_spec: &spec,
            sid: "S1",
            dirs: &dirs,
            audio_sink: Some("alice"),
            socket: &socket,
        };
        let cmd = app_command(&launch, &ManagementOptions::default());
        assert_eq!(cmd.program, "/bin/true");
        assert_eq!(cmd.args, vec!["S1"]);
        assert_eq!(cmd.env["HOME"], "/data/alice/home");
        assert_eq!(cmd.env["FOO"], "bar");
        assert_eq!(cmd.env["PULSE_SINK"], "spec-sink");
        assert_eq!(cmd.env["HYPERWARP_SESSION_ID"], "S1");
        assert_eq!(cmd.env["HYPERWARP_SOCKET"], "/tmp/hw.sock");
        let preload = [
            "/opt/hyperwarp/libhyperpreglue.so",
            "/opt/hyperwarp/target/release/libhyperwarphooker.so",
            "/opt/hyperwarp/libhyperglue.so",
        ];
        assert_eq!(cmd.env["LD_PRELOAD"], preload.join(":"));
    }

    #[test]
    fn wrapper_receives_env_as_arguments() {
        let wrapper = Wrapper {
            binary: "valgrind".into(),
            args: vec!["--leak-check=full".into()],
        };
        let cmd = CommandLine {
            program: "/usr/bin/app".into(),
            args: vec!["-x".into()],
            env: EnvLayer::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
            ]),
        };
        let wrapped = wrap(&wrapper, cmd);
        assert_eq!(wrapped.program, "valgrind");
        assert_eq!(
            wrapped.args,
            vec!["--leak-check=full", "env", "A=1", "B=2", "/usr/bin/app", "-x"]
        );
        assert!(wrapped.env.is_empty());
    }

    #[test]
    fn streamer_command_carries_secret_and_flags() {
        let dirs = SessionDirs::new(Path::new("/data"), "alice");
        let socket = PathBuf::from("/tmp/hw.sock");
        let mut opts = ManagementOptions::default();
        opts.debug = true;
        opts.streamer.encoder = Some("vaapi".into());
        opts.streamer.optimize = true;
        opts.streamer.driver_reset_workaround = true;
        let launch = StreamerLaunch {
            sid: "S1",
            user_id: "alice",
            secret: "top",
            socket: &socket,
            dirs: &dirs,
        };

        let cmd = streamer_command(&launch, &opts);
        assert_eq!(cmd.program, "/opt/hyperwarp/target/release/streamerd");
        assert_eq!(
            cmd.args,
            vec![
                "/tmp/hw.sock",
                "ws",
                "ws://127.0.0.1:8001/api/v1/ws",
                "--encoder",
                "vaapi",
                "--optimize"
            ]
        );
        assert_eq!(cmd.env["STREAMERD_SECRET"], "top");
        assert_eq!(cmd.env["RUST_LOG"], "debug");
        assert_eq!(cmd.env["STREAMERD_DRIVER_RESET_WORKAROUND"], "1");

        opts.streamer.profiler = Some(Profiler::Flamegraph);
        let profiled = streamer_command(&launch, &opts);
        assert_eq!(profiled.program, "flamegraph");
        assert_eq!(profiled.args[..3], ["-o", "/data/alice/logfiles/S1-flamegraph.svg", "--"]);
        assert_eq!(profiled.args[3], "/opt/hyperwarp/target/release/streamerd");
        assert_eq!(profiled.env["STREAMERD_SECRET"], "top");
    }
}

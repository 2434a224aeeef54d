//! `xcrun simctl` wrapper for iOS simulators
//!
//! Every subcommand runs through a [`ProcessRunner`]. Variables passed to
//! [`Simctl::spawn`] are prefixed with `SIMCTL_CHILD_`; simctl strips the
//! prefix and hands them to the spawned process.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use rdbg_core::prelude::*;
use rdbg_core::SimctlSettings;

use crate::process::{ProcessOutput, ProcessRunner, RunOptions};

const XCRUN: &str = "xcrun";
const CHILD_ENV_PREFIX: &str = "SIMCTL_CHILD_";

const LAUNCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ERASE_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const ERASE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// `-- iOS 9.3 --`
static SECTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-- iOS (.+) --$").expect("Invalid section regex"));

/// `    iPhone 6 (A99FFFC3-8E19-4DCF-B585-7D9D46B4C16E) (Shutdown)`
static DEVICE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s].+) \((\w+-.+\w+)\) \((\w+\s?\w+)\)").expect("Invalid device regex")
});

/// One simulator from `simctl list devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub name: String,
    pub udid: String,
    /// e.g. `Shutdown`, `Booted`, `Creating`
    pub state: String,
    pub sdk: String,
}

impl SimDevice {
    pub fn is_booted(&self) -> bool {
        self.state == "Booted"
    }
}

/// Simulators grouped by SDK version.
pub type DeviceList = BTreeMap<String, Vec<SimDevice>>;

pub struct Simctl<R> {
    runner: R,
    timeout: Option<Duration>,
    launch_retries: u32,
}

impl<R: ProcessRunner + Sync> Simctl<R> {
    pub fn new(runner: R, settings: &SimctlSettings) -> Self {
        Self {
            runner,
            timeout: settings.command_timeout(),
            launch_retries: settings.launch_retries.max(1),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn exec(&self, command: &str, args: &[&str]) -> Result<ProcessOutput> {
        self.exec_with(command, args, RunOptions::with_timeout(self.timeout))
            .await
    }

    async fn exec_with(
        &self,
        command: &str,
        args: &[&str],
        options: RunOptions,
    ) -> Result<ProcessOutput> {
        let mut full_args = Vec::with_capacity(args.len() + 2);
        full_args.push("simctl".to_string());
        full_args.push(command.to_string());
        full_args.extend(args.iter().map(|a| a.to_string()));

        self.runner
            .run(XCRUN, &full_args, options)
            .await
            .map_err(|e| match e {
                Error::Process { stderr, .. } => {
                    error!("simctl error running '{}': {}", command, stderr.trim());
                    Error::process(format!("simctl {command}"), stderr.trim())
                }
                other => other,
            })
    }

    pub async fn install_app(&self, udid: &str, app_path: &str) -> Result<()> {
        self.exec("install", &[udid, app_path]).await?;
        Ok(())
    }

    pub async fn remove_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        self.exec("uninstall", &[udid, bundle_id]).await?;
        Ok(())
    }

    /// Launch an installed app, retrying while the simulator settles.
    pub async fn launch(&self, udid: &str, bundle_id: &str) -> Result<()> {
        retry_interval(self.launch_retries, LAUNCH_RETRY_INTERVAL, || async move {
            self.exec("launch", &[udid, bundle_id]).await.map(|_| ())
        })
        .await
    }

    /// Run an executable inside the simulator with extra environment.
    pub async fn spawn(
        &self,
        udid: &str,
        executable: &str,
        env: &[(String, String)],
    ) -> Result<ProcessOutput> {
        let options = RunOptions::with_timeout(self.timeout).env(child_env(env));
        self.exec_with("spawn", &[udid, executable], options).await
    }

    pub async fn open_url(&self, udid: &str, url: &str) -> Result<()> {
        self.exec("openurl", &[udid, url]).await?;
        Ok(())
    }

    pub async fn boot(&self, udid: &str) -> Result<()> {
        self.exec("boot", &[udid]).await?;
        Ok(())
    }

    pub async fn shutdown(&self, udid: &str) -> Result<()> {
        self.exec("shutdown", &[udid]).await?;
        Ok(())
    }

    /// Create a simulator and wait until it leaves the `Creating` state.
    ///
    /// Returns the new device's udid.
    pub async fn create_device(
        &self,
        name: &str,
        device_type_id: &str,
        runtime_id: &str,
        timeout: Duration,
    ) -> Result<String> {
        let output = self
            .exec("create", &[name, device_type_id, runtime_id])
            .await?;
        let udid = output.stdout.trim().to_string();
        info!("Created simulator '{}' ({})", name, udid);

        let created = udid.as_str();
        let tries = (timeout.as_millis() / CREATE_POLL_INTERVAL.as_millis()).max(1) as u32;
        retry_interval(tries, CREATE_POLL_INTERVAL, || async move {
            let devices = self.list_devices().await?;
            match devices.values().flatten().find(|d| d.udid == created) {
                Some(device) if device.state == "Creating" => Err(Error::timeout(format!(
                    "simulator {created} still being created"
                ))),
                _ => Ok(()),
            }
        })
        .await?;

        Ok(udid)
    }

    pub async fn delete_device(&self, udid: &str) -> Result<()> {
        self.exec("delete", &[udid]).await?;
        Ok(())
    }

    /// Erase a simulator's content, retrying for up to `timeout`.
    pub async fn erase_device(&self, udid: &str, timeout: Duration) -> Result<()> {
        let tries = (timeout.as_millis() / ERASE_RETRY_INTERVAL.as_millis()).max(1) as u32;
        retry_interval(tries, ERASE_RETRY_INTERVAL, || async move {
            self.exec_with(
                "erase",
                &[udid],
                RunOptions::with_timeout(Some(ERASE_COMMAND_TIMEOUT)),
            )
            .await
            .map(|_| ())
        })
        .await
    }

    /// All simulators, keyed by SDK version.
    pub async fn list_devices(&self) -> Result<DeviceList> {
        let output = self.exec("list", &["devices"]).await?;
        parse_device_list(&output.stdout)
    }

    /// Simulators of one SDK version.
    pub async fn devices_for_sdk(&self, sdk: &str) -> Result<Vec<SimDevice>> {
        let mut devices = self.list_devices().await?;
        devices
            .remove(sdk)
            .ok_or_else(|| Error::config(format!("SDK '{sdk}' was not in list of simctl SDKs")))
    }
}

/// Prefix variable names so simctl forwards them to the child.
pub fn child_env(env: &[(String, String)]) -> Vec<(String, String)> {
    env.iter()
        .map(|(key, value)| (format!("{CHILD_ENV_PREFIX}{key}"), value.clone()))
        .collect()
}

/// Parse `simctl list devices` output.
///
/// Only `-- iOS X.Y --` sections are read; their indented lines are devices.
/// Lines inside a section that do not look like a device are an error.
pub fn parse_device_list(output: &str) -> Result<DeviceList> {
    let mut devices = DeviceList::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(caps) = SECTION_PATTERN.captures(line.trim_end()) {
            let sdk = caps[1].to_string();
            devices.entry(sdk.clone()).or_default();
            current = Some(sdk);
            continue;
        }

        let Some(sdk) = current.clone() else {
            continue;
        };
        if !line.starts_with("    ") {
            // any other header ends the iOS section
            current = None;
            continue;
        }

        let caps = DEVICE_PATTERN
            .captures(line)
            .ok_or_else(|| Error::process("simctl list", format!("could not match line: {line}")))?;
        let device = SimDevice {
            name: caps[1].to_string(),
            udid: caps[2].to_string(),
            state: caps[3].to_string(),
            sdk: sdk.clone(),
        };
        devices.entry(sdk).or_default().push(device);
    }

    if devices.is_empty() {
        return Err(Error::process("simctl list", "could not find device section"));
    }
    Ok(devices)
}

/// Run `f` up to `tries` times, sleeping `interval` between failures.
async fn retry_interval<T, F, Fut>(tries: u32, interval: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= tries => return Err(e),
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, tries, e);
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const LISTING: &str = "\
== Devices ==
-- iOS 8.4 --
    iPhone 4s (3CA6E7DD-220E-45E5-B716-1E992B3A429C) (Shutdown)
    iPad Air (A99FFFC3-8E19-4DCF-B585-7D9D46B4C16E) (Booted)
-- iOS 9.3 --
    iPhone 6 Plus (B6C9C1A2-3D4E-4F5A-8B7C-1D2E3F4A5B6C) (Shutdown)
-- watchOS 2.2 --
    Apple Watch - 38mm (C1D2E3F4-A5B6-4C7D-8E9F-0A1B2C3D4E5F) (Shutdown)
";

    /// Records every invocation and answers from a script.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<(Vec<String>, RunOptions)>>,
        replies: Mutex<VecDeque<Result<ProcessOutput>>>,
    }

    impl ScriptedRunner {
        fn reply(self, reply: Result<ProcessOutput>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        fn stdout(self, stdout: &str) -> Self {
            self.reply(Ok(ProcessOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            }))
        }

        fn calls(&self) -> Vec<(Vec<String>, RunOptions)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            command: &str,
            args: &[String],
            options: RunOptions,
        ) -> Result<ProcessOutput> {
            assert_eq!(command, XCRUN);
            self.calls.lock().unwrap().push((args.to_vec(), options));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProcessOutput::default()))
        }
    }

    fn simctl(runner: ScriptedRunner) -> Simctl<ScriptedRunner> {
        Simctl::new(runner, &SimctlSettings::default())
    }

    #[test]
    fn test_parse_device_list_groups_by_sdk() {
        let devices = parse_device_list(LISTING).unwrap();
        assert_eq!(devices.len(), 2);

        let ios8 = &devices["8.4"];
        assert_eq!(ios8.len(), 2);
        assert_eq!(ios8[0].name, "iPhone 4s");
        assert_eq!(ios8[0].udid, "3CA6E7DD-220E-45E5-B716-1E992B3A429C");
        assert_eq!(ios8[0].state, "Shutdown");
        assert!(ios8[1].is_booted());

        assert_eq!(devices["9.3"][0].name, "iPhone 6 Plus");
        assert_eq!(devices["9.3"][0].sdk, "9.3");
    }

    #[test]
    fn test_parse_device_list_without_sections_fails() {
        assert!(parse_device_list("== Devices ==\n").is_err());
    }

    #[test]
    fn test_parse_device_list_rejects_garbage_line() {
        let output = "-- iOS 9.3 --\n    not a device line\n";
        assert!(parse_device_list(output).is_err());
    }

    #[test]
    fn test_child_env_prefixes_keys() {
        let env = child_env(&[("DYLD_INSERT_LIBRARIES".into(), "/tmp/x.dylib".into())]);
        assert_eq!(
            env,
            vec![(
                "SIMCTL_CHILD_DYLD_INSERT_LIBRARIES".to_string(),
                "/tmp/x.dylib".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_install_passes_arguments() {
        let sim = simctl(ScriptedRunner::default());
        sim.install_app("UDID", "/tmp/App.app").await.unwrap();

        let calls = sim.runner().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["simctl", "install", "UDID", "/tmp/App.app"]);
        assert_eq!(calls[0].1.timeout, None);
    }

    #[tokio::test]
    async fn test_spawn_prefixes_environment() {
        let sim = simctl(ScriptedRunner::default());
        sim.spawn("UDID", "/bin/ls", &[("FOO".into(), "bar".into())])
            .await
            .unwrap();

        let calls = sim.runner().calls();
        assert_eq!(calls[0].0, vec!["simctl", "spawn", "UDID", "/bin/ls"]);
        assert_eq!(
            calls[0].1.env,
            vec![("SIMCTL_CHILD_FOO".to_string(), "bar".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failure_is_process_error_with_stderr() {
        let runner = ScriptedRunner::default().reply(Err(Error::process(
            "xcrun simctl boot UDID",
            "Unable to boot device in current state: Booted\n",
        )));
        let err = simctl(runner).boot("UDID").await.unwrap_err();
        match err {
            Error::Process { command, stderr } => {
                assert_eq!(command, "simctl boot");
                assert_eq!(stderr, "Unable to boot device in current state: Booted");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_retries_until_success() {
        let runner = ScriptedRunner::default()
            .reply(Err(Error::process("launch", "not ready")))
            .reply(Err(Error::process("launch", "not ready")))
            .stdout("com.example.app: 1234\n");
        let sim = simctl(runner);
        sim.launch("UDID", "com.example.app").await.unwrap();
        assert_eq!(sim.runner().calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_gives_up_after_configured_retries() {
        let runner = ScriptedRunner::default()
            .reply(Err(Error::process("launch", "1")))
            .reply(Err(Error::process("launch", "2")));
        let settings = SimctlSettings {
            launch_retries: 2,
            ..Default::default()
        };
        let sim = Simctl::new(runner, &settings);
        let err = sim.launch("UDID", "com.example.app").await.unwrap_err();
        assert!(matches!(err, Error::Process { ref stderr, .. } if stderr == "2"));
        assert_eq!(sim.runner().calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_device_waits_out_creating_state() {
        let creating = "-- iOS 9.3 --\n    Test (NEW-UDID-0000-1111) (Creating)\n";
        let ready = "-- iOS 9.3 --\n    Test (NEW-UDID-0000-1111) (Shutdown)\n";
        let runner = ScriptedRunner::default()
            .stdout("NEW-UDID-0000-1111\n")
            .stdout(creating)
            .stdout(ready);
        let sim = simctl(runner);

        let udid = sim
            .create_device(
                "Test",
                "com.apple.CoreSimulator.SimDeviceType.iPhone-6",
                "com.apple.CoreSimulator.SimRuntime.iOS-9-3",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(udid, "NEW-UDID-0000-1111");
        assert_eq!(sim.runner().calls().len(), 3);
    }

    #[tokio::test]
    async fn test_devices_for_unknown_sdk_fails() {
        let sim = simctl(ScriptedRunner::default().stdout(LISTING));
        assert!(sim.devices_for_sdk("7.0").await.is_err());
    }
}

//! Command synthesis, checked by actually running the built commands
//! through a POSIX shell with fake `sshpass`, `ssh` and `docker` on `PATH`.


use secrecy::SecretString;

use deploy_relay::command::{
    build_login, build_pull, build_run, build_script_runner, parse_secret_env, ssh_invoke,
    ContainerSpec, EnvMap, ImageRef, RegistryCredentials, RunnerConfig, SshTarget,
};
use deploy_relay::config::SshOptions;
use test_harness::Shims;

const HOSTILE: &[&str] = &[
    "it's",
    "\"double\"",
    "`touch CANARY`",
    "$(touch CANARY)",
    "a; touch CANARY",
    "line1\nline2",
    "'; touch CANARY; echo '",
    "\\'",
    "$HOME ${PATH} *",
    "-oProxyCommand=touch CANARY",
    "",
];

fn target(password: &str) -> SshTarget {
    SshTarget::new("10.1.2.3", "deploy", SecretString::from(password.to_string()))
}

fn canary(shims: &Shims) -> std::path::PathBuf {
    shims.file("CANARY")
}

/// Injected commands may append to the canary path (ssh adds `@host`).
fn canary_fired(shims: &Shims) -> bool {
    shims.created_with_prefix("CANARY")
}

/// Substitute the canary's absolute path into a hostile value.
fn arm(value: &str, shims: &Shims) -> String {
    value.replace("CANARY", &canary(shims).display().to_string())
}

#[tokio::test]
async fn test_plain_script_runs_on_target() {
    let shims = Shims::new();
    let cfg = RunnerConfig::new(target("pw")).with_script("echo hi");

    let output = shims.run(&build_script_runner(&cfg)).await;

    assert!(output.success(), "stderr: {}", output.stderr);
    assert_eq!(output.stdout, "hi\n");
    assert_eq!(shims.read("sshpass.password").as_deref(), Some("pw"));
}

#[tokio::test]
async fn test_ssh_receives_expected_arguments() {
    let shims = Shims::new();
    let target = target("pw")
        .with_port(2222)
        .with_key_path("/keys/id ed25519");
    let cfg = RunnerConfig::new(target).with_script("true");

    let output = shims.run(&build_script_runner(&cfg)).await;
    assert!(output.success(), "stderr: {}", output.stderr);

    let args = shims.ssh_args();
    assert_eq!(
        args,
        vec![
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=30",
            "-o",
            "ServerAliveInterval=60",
            "-o",
            "ServerAliveCountMax=3",
            "-p",
            "2222",
            "-i",
            "/keys/id ed25519",
            "--",
            "deploy@10.1.2.3",
            "true",
        ]
    );
}

#[tokio::test]
async fn test_hostile_passwords_are_single_literals() {
    for value in HOSTILE {
        let shims = Shims::new();
        let password = arm(value, &shims);
        let cfg = RunnerConfig::new(target(&password)).with_script("true");

        let output = shims.run(&build_script_runner(&cfg)).await;

        if password.is_empty() {
            // No sshpass for key-only authentication
            assert!(shims.read("sshpass.password").is_none());
        } else {
            assert!(output.success(), "value {:?}: {}", value, output.stderr);
            assert_eq!(shims.read("sshpass.password").as_deref(), Some(password.as_str()));
        }
        assert!(!canary_fired(&shims), "value {:?} executed a command", value);
    }
}

#[tokio::test]
async fn test_hostile_env_values_are_exported_literally() {
    for value in HOSTILE {
        let shims = Shims::new();
        let armed = arm(value, &shims);
        let env: EnvMap = [("VALUE", armed.as_str())].into_iter().collect();
        let cfg = RunnerConfig::new(target("pw"))
            .with_script("printf '%s' \"$VALUE\"")
            .with_script_env(env);

        let output = shims.run(&build_script_runner(&cfg)).await;

        assert!(output.success(), "value {:?}: {}", value, output.stderr);
        assert_eq!(output.stdout, armed, "value {:?} was altered", value);
        assert!(!canary_fired(&shims), "value {:?} executed a command", value);
    }
}

#[tokio::test]
async fn test_hostile_usernames_stay_in_destination() {
    for value in HOSTILE {
        let shims = Shims::new();
        let user = arm(value, &shims);
        let target = SshTarget::new("10.1.2.3", user.clone(), SecretString::from("pw".to_string()));
        let cfg = RunnerConfig::new(target).with_script("printf ok");

        let output = shims.run(&build_script_runner(&cfg)).await;

        assert!(output.success(), "value {:?}: {}", value, output.stderr);
        assert_eq!(output.stdout, "ok", "value {:?}", value);
        assert!(!canary_fired(&shims), "value {:?} executed a command", value);
    }
}

#[tokio::test]
async fn test_hostile_hosts_stay_in_destination() {
    for value in HOSTILE {
        let shims = Shims::new();
        let host = arm(value, &shims);
        for user in ["deploy", ""] {
            let target = SshTarget::new(host.clone(), user, SecretString::from("pw".to_string()));
            let cfg = RunnerConfig::new(target).with_script("printf ok");

            let output = shims.run(&build_script_runner(&cfg)).await;

            assert!(output.success(), "value {:?}: {}", value, output.stderr);
            assert_eq!(output.stdout, "ok", "value {:?}", value);
            assert!(!canary_fired(&shims), "value {:?} executed a command", value);
        }
    }
}

#[tokio::test]
async fn test_destination_follows_end_of_options() {
    let shims = Shims::new();
    let user = arm("-oProxyCommand=touch CANARY", &shims);
    let target = SshTarget::new("10.1.2.3", user.clone(), SecretString::from("pw".to_string()));
    let cfg = RunnerConfig::new(target).with_script("true");

    shims.run(&build_script_runner(&cfg)).await;

    let args = shims.ssh_args();
    let end = args.iter().position(|a| a == "--").unwrap();
    assert_eq!(args[end + 1], format!("{}@10.1.2.3", user));
    assert!(args[..end].iter().all(|a| !a.contains("ProxyCommand")));
    assert!(!canary_fired(&shims));
}

#[tokio::test]
async fn test_hostile_key_path_is_single_literal() {
    for value in HOSTILE.iter().filter(|v| !v.is_empty()) {
        let shims = Shims::new();
        let key_path = arm(value, &shims);
        let cfg = RunnerConfig::new(target("pw").with_key_path(key_path.clone())).with_script("true");

        shims.run(&build_script_runner(&cfg)).await;

        let args = shims.ssh_args().join("\n");
        assert!(args.contains(&key_path), "value {:?} was altered", value);
        assert!(!canary_fired(&shims), "value {:?} executed a command", value);
    }
}

#[tokio::test]
async fn test_secret_with_quote_injection_is_inert() {
    let shims = Shims::new();
    let content = format!(
        "API_KEY=abc'; touch {}\nDB=xyz",
        canary(&shims).display()
    );
    let env = parse_secret_env(&content);
    assert_eq!(env.len(), 2);

    let cfg = RunnerConfig::new(target("pw"))
        .with_script("printf '%s|%s' \"$API_KEY\" \"$DB\"")
        .with_script_env(env);

    let output = shims.run(&build_script_runner(&cfg)).await;

    assert!(output.success(), "stderr: {}", output.stderr);
    assert_eq!(
        output.stdout,
        format!("abc'; touch {}|xyz", canary(&shims).display())
    );
    assert!(!canary_fired(&shims));
}

#[test]
fn test_rm_rf_secret_parses_to_two_literal_entries() {
    let env = parse_secret_env("API_KEY=abc'; rm -rf /\nDB=xyz");
    let entries: Vec<_> = env.iter().collect();
    assert_eq!(entries, vec![("API_KEY", "abc'; rm -rf /"), ("DB", "xyz")]);

    let cfg = RunnerConfig::new(target("pw"))
        .with_script("true")
        .with_script_env(env);
    let command = build_script_runner(&cfg);
    // The value only ever appears inside quoting, never as bare words
    assert!(!command.expose().contains("abc'; rm"));
}

#[tokio::test]
async fn test_multiline_script_with_quotes() {
    let shims = Shims::new();
    let script = "x=\"it's\"\necho \"$x\"\necho 'a  b'\nfor i in 1 2; do echo $i; done";
    let cfg = RunnerConfig::new(target("pw")).with_script(script);

    let output = shims.run(&build_script_runner(&cfg)).await;

    assert!(output.success(), "stderr: {}", output.stderr);
    assert_eq!(output.stdout, "it's\na  b\n1\n2\n");
}

#[tokio::test]
async fn test_env_not_injected_unless_requested() {
    let shims = Shims::new();
    let mut cfg = RunnerConfig::new(target("pw")).with_script("printf '%s' \"${TOKEN:-unset}\"");
    cfg.env = [("TOKEN", "abc")].into_iter().collect();

    let output = shims.run(&build_script_runner(&cfg)).await;
    assert_eq!(output.stdout, "unset");
}

#[tokio::test]
async fn test_docker_run_receives_one_argument_per_env_entry() {
    let shims = Shims::new();
    let env: EnvMap = [("A", "x' y"), ("B", "$(touch CANARY)"), ("A", "z")]
        .into_iter()
        .collect();
    let cfg = RunnerConfig::new(target("pw"))
        .with_container(
            ContainerSpec::new("web app", ImageRef::new("registry.local", "app", "1.0"))
                .with_network("gateway_network", Some("172.30.0.20".to_string())),
        )
        .with_container_env(env);

    let output = shims.run(&build_run(&cfg)).await;

    assert!(output.success(), "stderr: {}", output.stderr);
    let args: Vec<&str> = output.stdout.lines().collect();
    assert_eq!(
        args,
        vec![
            "[run]",
            "[-d]",
            "[--name]",
            "[web app]",
            "[-e]",
            "[A=z]",
            "[-e]",
            "[B=$(touch CANARY)]",
            "[--network]",
            "[gateway_network]",
            "[--ip]",
            "[172.30.0.20]",
            "[registry.local/app:1.0]",
        ]
    );
}

#[tokio::test]
async fn test_docker_login_and_pull() {
    let shims = Shims::new();
    let cfg = RunnerConfig::new(target("pw"))
        .with_registry_credentials(RegistryCredentials {
            username: "ci bot".to_string(),
            password: SecretString::from("p'w;d".to_string()),
        })
        .with_container(ContainerSpec::new(
            "web",
            ImageRef::new("registry.local", "app", "latest"),
        ));

    let login = shims.run(&build_login(&cfg)).await;
    assert_eq!(
        login.stdout.lines().collect::<Vec<_>>(),
        vec!["[login]", "[-u]", "[ci bot]", "[-p]", "[p'w;d]", "[registry.local]"]
    );

    let pull = shims.run(&build_pull(&cfg)).await;
    assert_eq!(
        pull.stdout.lines().collect::<Vec<_>>(),
        vec!["[pull]", "[registry.local/app:latest]"]
    );
}

#[tokio::test]
async fn test_login_without_credentials_runs_nothing() {
    let shims = Shims::new();
    let output = shims.run(&build_login(&RunnerConfig::new(target("pw")))).await;
    assert!(output.success(), "stderr: {}", output.stderr);
    assert_eq!(output.stdout, "");
}

#[test]
fn test_strict_host_key_checking_option() {
    let opts = SshOptions {
        strict_host_key_checking: true,
        ..SshOptions::default()
    };
    let command = ssh_invoke(&target("pw"), &opts, "true");
    assert!(command.expose().contains("StrictHostKeyChecking=yes"));
}

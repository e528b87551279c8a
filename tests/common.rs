use assert_cmd::cargo::CommandCargoExt as _;

pub fn csbench_raw_command() -> std::process::Command {
    std::process::Command::cargo_bin("csbench").unwrap()
}

pub fn csbench() -> assert_cmd::Command {
    assert_cmd::Command::from_std(csbench_raw_command())
}

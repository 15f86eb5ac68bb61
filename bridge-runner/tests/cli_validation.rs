mod common;

use std::io::Write;

use common::{assert_exit_code, assert_output_contains, echo_proto, run};

#[test]
fn script_file_not_found() {
    let r = run(&["/no/such/script.js"]);
    assert_exit_code(&r, 2);
    assert_output_contains(&r, "script file not found");
}

#[test]
fn protoset_and_proto_conflict() {
    let script = write_script("");
    let r = run(&[
        script.path().to_str().unwrap(),
        "--protoset",
        "a.pb",
        "--proto",
        "b.proto",
    ]);
    assert_exit_code(&r, 2);
    assert_output_contains(&r, "protoset");
}

#[test]
fn bad_protoset_file_surfaces_as_runtime_error_not_validation_error() {
    let script = write_script("");
    let r = run(&[script.path().to_str().unwrap(), "--protoset", "/dev/null"]);
    assert_exit_code(&r, 1);
}

#[test]
fn empty_registry_is_fine_for_a_status_only_script() {
    let script =
        write_script("if (grpc.status.OK !== 0) throw new Error('bad status namespace');");
    let r = run(&[script.path().to_str().unwrap()]);
    assert_exit_code(&r, 0);
}

#[test]
fn script_with_echo_proto_resolves_descriptor() {
    let script = write_script(
        "const d = grpc.findDescriptor('testecho.EchoRequest'); \
         if (d.fullName !== 'testecho.EchoRequest') throw new Error('wrong descriptor: ' + d.fullName);",
    );
    let r = run(&[script.path().to_str().unwrap(), "--proto", &echo_proto()]);
    assert_exit_code(&r, 0);
}

fn write_script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".js").tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

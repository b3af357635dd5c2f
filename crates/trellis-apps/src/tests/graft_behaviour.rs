//! Behaviour tests for command and hook grafting.

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use super::{binding, builtin_tree};
use crate::error::{CommandError, LinkError};
use crate::graft::{CommandTree, Invocation, link_commands, link_hooks};
use crate::protocol::{CommandSpec, HookSpec, Manifest};
use crate::testing::{EventLog, FakeApp};

struct World {
    log: EventLog,
    tree: Option<CommandTree>,
    before: String,
    outcome: Option<Result<(), CommandError>>,
    link_error: Option<LinkError>,
}

#[fixture]
fn world() -> World {
    World {
        log: EventLog::new(),
        tree: None,
        before: String::new(),
        outcome: None,
        link_error: None,
    }
}

fn unquote(text: &str) -> &str {
    text.trim_matches('"')
}

fn tree(world: &mut World) -> &mut CommandTree {
    world.tree.as_mut().expect("tree built")
}

fn attach_hook(world: &mut World, name: &str, path: &str, app: FakeApp) {
    let hook = HookSpec::new(unquote(name), unquote(path));
    let bound = binding(&format!("github.com/org/{}", unquote(name)), app);
    link_hooks(tree(world), &bound, &[hook]).expect("hook links");
}

#[given("the built-in command tree")]
fn given_tree(world: &mut World) {
    let built = builtin_tree(&world.log);
    world.before = built.dump();
    world.tree = Some(built);
}

#[given("an app hook {name} on {path}")]
fn given_hook(world: &mut World, name: String, path: String) {
    let app = FakeApp::new(Manifest::new("app"), world.log.clone());
    attach_hook(world, &name, &path, app);
}

#[given("a hook {name} on {path} failing at {event}")]
fn given_failing_hook(world: &mut World, name: String, path: String, event: String) {
    let app = FakeApp::new(Manifest::new("app"), world.log.clone()).fail_on(unquote(&event));
    attach_hook(world, &name, &path, app);
}

#[when("{path} is run")]
fn when_run(world: &mut World, path: String) {
    let invocation = Invocation::new(unquote(&path));
    world.outcome = Some(tree(world).execute(&invocation));
}

#[when("an app contributes the command {usage} under {path}")]
fn when_contribute(world: &mut World, usage: String, path: String) {
    let app = binding(
        "github.com/org/app",
        FakeApp::new(Manifest::new("app"), world.log.clone()),
    );
    let spec = CommandSpec::new(unquote(&usage)).placed_under(unquote(&path));
    world.link_error = link_commands(tree(world), &app, &[spec]).err();
}

#[then("the command succeeds")]
fn then_succeeds(world: &mut World) {
    let outcome = world.outcome.as_ref().expect("command ran");
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[then("the command fails with {call}")]
fn then_fails(world: &mut World, call: String) {
    let error = world
        .outcome
        .as_ref()
        .expect("command ran")
        .as_ref()
        .expect_err("command failed");
    assert!(
        matches!(error, CommandError::App { call: made, .. } if *made == unquote(&call)),
        "{error}"
    );
}

#[then("the calls were {calls}")]
fn then_calls(world: &mut World, calls: String) {
    let expected: Vec<&str> = unquote(&calls).split(", ").collect();
    assert_eq!(world.log.events(), expected);
}

#[then("linking fails because {name} already exists under {parent}")]
fn then_collision(world: &mut World, name: String, parent: String) {
    let error = world.link_error.as_ref().expect("link failed");
    assert_eq!(
        error.to_string(),
        format!(
            "app command \"{}\" already exists under \"{}\"",
            unquote(&name),
            unquote(&parent)
        )
    );
}

#[then("the tree is unchanged")]
fn then_unchanged(world: &mut World) {
    let before = world.before.clone();
    assert_eq!(tree(world).dump(), before);
}

#[scenario(path = "tests/features/grafting.feature", index = 0)]
fn hooks_run_in_registration_order(world: World) {
    let _ = world;
}

#[scenario(path = "tests/features/grafting.feature", index = 1)]
fn failing_pre_phase_skips_the_body(world: World) {
    let _ = world;
}

#[scenario(path = "tests/features/grafting.feature", index = 2)]
fn root_collision_is_rejected(world: World) {
    let _ = world;
}

#[scenario(path = "tests/features/grafting.feature", index = 3)]
fn nested_collision_is_rejected(world: World) {
    let _ = world;
}

//! Crate-level test helpers and behaviour suites.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::HostClientApi;
use crate::graft::{AppBinding, CommandNode, CommandTree, Invocation};
use crate::protocol::{FlagKind, FlagSpec};
use crate::testing::{EventLog, FakeApp};

mod graft_behaviour;

/// Built-in tree used throughout: `trellis scaffold {chain, module}`.
pub(crate) fn builtin_tree(log: &EventLog) -> CommandTree {
    let chain_log = log.clone();
    let chain = CommandNode::runnable(
        "chain",
        Arc::new(move |_: &Invocation| {
            chain_log.push("chain");
            Ok(())
        }),
    )
    .with_flag(FlagSpec::new("path", FlagKind::String));
    let module = CommandNode::runnable("module", Arc::new(|_: &Invocation| Ok(())));
    CommandTree::new(
        CommandNode::group("trellis")
            .with_child(CommandNode::group("scaffold").with_child(chain).with_child(module)),
    )
}

pub(crate) fn binding(reference: &str, app: FakeApp) -> AppBinding {
    AppBinding::new(
        reference,
        Arc::new(app),
        BTreeMap::new(),
        Arc::new(HostClientApi::new()),
    )
}

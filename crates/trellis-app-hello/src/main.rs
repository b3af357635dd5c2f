//! Entry point of the `hello` reference app.

use std::process::ExitCode;
use std::sync::Arc;

use trellis_app_hello::{APP_NAME, HelloApp};

fn main() -> ExitCode {
    trellis_apps::serve::run(APP_NAME, Arc::new(HelloApp::new()))
}

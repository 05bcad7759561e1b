pub mod alarm;
pub mod cli;
pub mod commands;
pub mod config;
pub mod datetime;
pub mod entry;
pub mod registry;
pub mod render;
pub mod sound;
pub mod store;
pub mod watch;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting knell"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.knellrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let mut renderer =
    render::Renderer::new(&cfg)?;
  let inv = cli::Invocation::parse(
    &cfg, cli.rest
  )?;

  let mut session =
    commands::Session::new(
      cfg,
      data_dir.clone(),
      cli.tab
    )
    .with_context(|| {
      format!(
        "failed to open tabs in {}",
        data_dir.display()
      )
    })?;

  commands::dispatch(
    &mut session,
    &mut renderer,
    inv
  )?;

  info!("done");
  Ok(())
}

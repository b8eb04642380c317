//! Print plot series

use std::path::Path;

use anyhow::Result;
use tracking::load_plot_series;

use crate::util;

pub async fn run_show(file: &Path) -> Result<()> {
    let series = load_plot_series(&util::absolute(file)?)?;
    println!("{}", serde_json::to_string_pretty(&series)?);
    Ok(())
}

//! Show parameters used by the pipeline

use std::collections::BTreeMap;

use anyhow::Result;
use owo_colors::OwoColorize;
use tracking::params::{read_params, render_param_values};

use crate::util;

pub async fn run_show() -> Result<()> {
    let repo = util::open_repo()?;

    let mut values = BTreeMap::new();
    for stage in repo.pipeline()?.all_stages()? {
        for (file, params) in read_params(repo.root(), &stage.params)? {
            values.entry(file).or_insert_with(BTreeMap::new).extend(params);
        }
    }

    let rendered = render_param_values(&values);
    if rendered.is_empty() {
        println!("{}", "No parameters used by the pipeline".dimmed());
        return Ok(());
    }
    for (key, value) in rendered {
        println!("  {:<28} {}", key.cyan(), value);
    }
    Ok(())
}

use meshcell_core::Config;
use std::io::{self, Write};
use std::path::PathBuf;

pub async fn run(config: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = super::config_path(config);

    if path.exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    Config::default().save(&path)?;
    println!("✓ Created config: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Run `meshcell hub` to start the bus");
    println!("  2. Run `meshcell directory` to start the agent directory");
    println!("  3. Run `meshcell agent` in as many terminals as you like");
    println!("  4. Run `meshcell agents list` to see who is online");

    Ok(())
}

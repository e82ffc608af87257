use anyhow::Result;

fn main() -> Result<()> {
    portalbox::cli::run()
}

use anyhow::Result;

fn main() -> Result<()> {
    graphmirror_cli::run()
}

use anyhow::Result;
use sessions_observe::Observer;
use std::io::Read;
use std::path::Path;

pub(crate) fn observer(workspace: &Path, verbose: bool) -> Result<Observer> {
    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(verbose);
    Ok(observer)
}

pub(crate) fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

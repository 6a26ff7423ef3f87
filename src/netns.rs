// Run work inside another network namespace

use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

/// Host namespace of the current process.
pub const HOST_NETNS: &str = "/proc/self/ns/net";

/// Runs `f` on a fresh OS thread switched into the namespace at `path`
/// (`None` = the caller's namespace). The thread exits afterwards so the
/// switch never leaks into a runtime worker.
pub async fn run_in_netns<T, F>(path: Option<PathBuf>, f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("netns".into())
        .spawn(move || {
            let result = enter(path.as_deref()).and_then(|()| f());
            let _ = tx.send(result);
        })?;
    rx.await
        .map_err(|_| io::Error::other("namespace thread exited without a result"))?
}

/// Like [`run_in_netns`], with the current tokio runtime entered on that thread,
/// for sockets that register with the reactor when they are created.
pub async fn run_in_netns_with_runtime<T, F>(path: Option<PathBuf>, f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    run_in_netns(path, move || {
        let _guard = handle.enter();
        f()
    })
    .await
}

fn enter(path: Option<&Path>) -> io::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let file = File::open(path)?;
    setns(&file, CloneFlags::CLONE_NEWNET)?;
    Ok(())
}

/// Kernel identity of a namespace file.
pub fn namespace_inode(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.ino())
}

use runtimelink_peer::PeerError;

use crate::cmd::{discovery, parse_duration, DiscoverArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_record, Discovered, OutputFormat};

pub fn run(args: DiscoverArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let discovery = discovery(args.discovery_dir.as_ref());
    let path = discovery
        .path_for(&args.identifier)
        .map_err(|err| peer_error("discover failed", PeerError::Discovery(err)))?;
    let port = discovery
        .read(&args.identifier, timeout)
        .map_err(|err| peer_error("discover failed", PeerError::Discovery(err)))?;

    print_record(
        &Discovered {
            identifier: &args.identifier,
            port,
            path: path.display().to_string(),
        },
        format,
    );
    Ok(SUCCESS)
}

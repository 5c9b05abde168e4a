// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Locate a file on an XRootD cluster and print the replica list.
//!
//! ```sh
//! cargo run --example locate -- root://eospublic.cern.ch//eos/file.root
//! ```

use std::time::Duration;
use xrootd_rs::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let arg = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "root://localhost//tmp/demo".to_string());
    let url = Url::parse(&arg).map_err(|e| anyhow::anyhow!("{}", e))?;

    let pm = PostMaster::new(Config::new().with_request_timeout(30));
    pm.initialize();
    pm.start();

    let request = Message::request(RequestCode::Locate, &url.path_with_params());
    match pm.send_recv(&url, request, Some(Duration::from_secs(30))).await {
        Ok(AnyObject::Locations(info)) => {
            for location in info.locations() {
                println!("{:?} {:?} {}", location.location_type, location.access, location.address);
            }
        }
        Ok(other) => println!("unexpected payload: {:?}", other),
        Err(status) => eprintln!("{}", status),
    }

    pm.finalize().await;
    pm.stop().await;
    Ok(())
}

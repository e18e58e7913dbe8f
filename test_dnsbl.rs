#![allow(clippy::uninlined_format_args)]

use imap_spamfilter::config::ReputationConfig;
use imap_spamfilter::reputation::dnsbl_query_name;
use imap_spamfilter::ReputationResolver;
use std::net::IpAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("Testing REAL blocklist lookups (not mock data)...");

    let config = ReputationConfig {
        quiet_mode: false,
        use_cache: false,
        ..Default::default()
    };
    let zone = config.zone.clone();
    let resolver = ReputationResolver::new(config);

    resolver.initialize().await?;
    println!("Authoritative servers for {}:", zone);
    for server in resolver.authoritative_servers() {
        println!("  {}", server);
    }

    // 127.0.0.2 is listed on every DNSBL, 127.0.0.1 never is
    let test_addresses: Vec<(IpAddr, bool)> = vec![
        (IpAddr::from([127, 0, 0, 2]), true),
        (IpAddr::from([127, 0, 0, 1]), false),
    ];

    for (ip, expect_listed) in test_addresses {
        println!("\n=== Testing {} ({}) ===", ip, dnsbl_query_name(ip, &zone));

        match resolver.is_blocked(ip).await {
            Ok(listing) => {
                match &listing {
                    Some(ids) => println!("  Listed on: {}", ids),
                    None => println!("  Not listed"),
                }
                if listing.is_some() == expect_listed {
                    println!("✅ As expected");
                } else {
                    println!("❌ Unexpected result");
                    println!("  Public resolvers are often refused by the blocklist,");
                    println!("  try again from a host with its own resolver.");
                }
            }
            Err(e) => {
                println!("❌ Lookup failed: {}", e);
                println!("  This could be due to:");
                println!("    - Network connectivity issues");
                println!("    - Blocklist refusing the query");
            }
        }
    }

    Ok(())
}

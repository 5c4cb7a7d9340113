//! # Seed Data Generator
//!
//! Populates a development database with listings, variants and one open
//! cart per storefront.
//!
//! ## Usage
//! ```bash
//! # Seed ./bazaar_dev.db with the default catalog
//! cargo run -p bazaar-db --bin seed
//!
//! # Specify database path and stock per listing
//! cargo run -p bazaar-db --bin seed -- --db ./data/bazaar.db --stock 25
//! ```

use std::env;

use bazaar_core::Document;
use bazaar_db::{Database, DbConfig, NewListing, NewVariant};

/// (storefront, sku prefix, name, price in cents)
const CATALOG: &[(i64, &str, &str, i64)] = &[
    (1, "CER-MUG", "Stoneware Mug", 1800),
    (1, "CER-BWL", "Ramen Bowl", 2600),
    (1, "CER-PLT", "Dinner Plate", 2200),
    (2, "TXT-TEE", "Organic Tee", 2400),
    (2, "TXT-HOD", "Heavyweight Hoodie", 5800),
    (2, "TXT-CAP", "Canvas Cap", 1900),
    (3, "PPR-NTB", "Dot Grid Notebook", 1400),
    (3, "PPR-PST", "Risograph Poster", 3500),
];

/// Size variants for apparel: (suffix, price override in cents)
const SIZES: &[(&str, Option<i64>)] = &[("S", None), ("M", None), ("L", None), ("XL", Some(200))];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut stock: i64 = 20;
    let mut db_path = String::from("./bazaar_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stock" | "-s" => {
                if i + 1 < args.len() {
                    stock = args[i + 1].parse().unwrap_or(20);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Bazaar Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -s, --stock <N>    Units of stock per listing (default: 20)");
                println!("  -d, --db <PATH>    Database file path (default: ./bazaar_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Bazaar Seed Data Generator");
    println!("==========================");
    println!("Database: {}", db_path);
    println!("Stock per listing: {}", stock);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database, migrations applied");

    let existing = db.listings().count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} listings", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let mut first_listing_per_storefront = std::collections::BTreeMap::new();

    for (storefront_id, sku, name, price_cents) in CATALOG {
        let listing = match db
            .listings()
            .insert(&NewListing::new(*storefront_id, *sku, *name, *price_cents, stock))
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                eprintln!("Failed to insert {}: {}", sku, e);
                continue;
            }
        };
        first_listing_per_storefront
            .entry(*storefront_id)
            .or_insert((listing.id, listing.price_cents));

        if sku.starts_with("TXT") {
            for (size, price_override) in SIZES {
                let variant = NewVariant {
                    listing_id: listing.id,
                    sku: format!("{}-{}", sku, size),
                    name: format!("{} / {}", name, size),
                    attributes: Document::new().with("size", *size),
                    price_cents: price_override.map(|extra| price_cents + extra),
                };
                if let Err(e) = db.listings().insert_variant(&variant).await {
                    eprintln!("Failed to insert variant {}: {}", variant.sku, e);
                }
            }
        }
        println!("  + {} {} (${:.2})", sku, name, *price_cents as f64 / 100.0);
    }

    println!();
    for (storefront_id, (listing_id, price_cents)) in first_listing_per_storefront {
        let cart = db.carts().create(Some(1000 + storefront_id)).await?;
        db.carts().add_item(cart.id, listing_id, None, 1, price_cents).await?;
        println!("✓ Cart {} opened for storefront {}", cart.id, storefront_id);
    }

    println!();
    println!("✓ Seeded {} listings", db.listings().count().await?);
    db.close().await;
    Ok(())
}

//! `opsboard sort`: display order preview.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use opsboard_core::{Order, OrderStore};

/// Arguments for `opsboard sort`.
#[derive(Args, Debug)]
pub struct SortArgs {
    /// YAML file holding a list of orders.
    pub orders: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct GroupJson {
    group: String,
    order: Vec<String>,
}

#[derive(Tabled)]
struct OrderRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "order")]
    id: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "priority")]
    priority: String,
    #[tabled(rename = "sort order")]
    sort_order: String,
}

impl SortArgs {
    pub fn run(self) -> Result<()> {
        let contents = std::fs::read_to_string(&self.orders)
            .with_context(|| format!("failed to read {}", self.orders.display()))?;
        let orders: Vec<Order> = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.orders.display()))?;
        let store = OrderStore::from_orders(orders);

        if self.json {
            let groups: Vec<GroupJson> = store
                .groups()
                .map(|group| GroupJson {
                    group: group.0.clone(),
                    order: store.display_order(group).into_iter().map(|id| id.0).collect(),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&groups).context("failed to serialize JSON")?
            );
            return Ok(());
        }

        if store.is_empty() {
            println!("No orders.");
            return Ok(());
        }
        for group in store.groups() {
            println!("{}", group.0.to_uppercase().bold());
            let rows: Vec<OrderRow> = store
                .group(group)
                .iter()
                .enumerate()
                .map(|(i, order)| OrderRow {
                    position: i + 1,
                    id: order.id.0.clone(),
                    status: order.status.to_string(),
                    priority: if order.is_priority { "yes".into() } else { String::new() },
                    sort_order: order
                        .sort_order
                        .map_or_else(|| "-".to_string(), |s| s.to_string()),
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }
        Ok(())
    }
}

//! Example: a player hits a monster inside a transaction
//!
//! The monster loses hitpoints; if it dies it is removed and the player gains
//! experience and possibly a level. Either every document changes or none.
//!
//! Run with: cargo run --example player_hits_monster

use proven_coordinator::{
    AttemptContext, Collection, Durability, OperationError, TransactionConfig, TransactionError,
    Transactions,
};
use proven_kv::MemoryStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Player {
    experience: u32,
    hitpoints: u32,
    logged_in: bool,
    level: u32,
    name: String,
    uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Monster {
    experience_when_killed: u32,
    hitpoints: i64,
    name: String,
    uuid: String,
}

fn level_for_experience(experience: u32) -> u32 {
    experience / 100
}

async fn player_hits_monster(
    transactions: &Transactions,
    collection: &Collection,
    damage: i64,
    player_id: &str,
    monster_id: &str,
) -> Result<(), TransactionError> {
    transactions
        .run(|ctx: AttemptContext| {
            let collection = collection.clone();
            async move {
                let monster = ctx.get(&collection, monster_id).await?;
                let monster_body: Monster = monster.content()?;
                let new_hitpoints = monster_body.hitpoints - damage;

                let player = ctx.get(&collection, player_id).await?;

                if new_hitpoints <= 0 {
                    ctx.remove(&monster).await?;

                    let mut player_body: Player = player.content()?;
                    player_body.experience += monster_body.experience_when_killed;
                    player_body.level = level_for_experience(player_body.experience);
                    ctx.replace(&player, &player_body).await?;
                } else {
                    let monster_body = Monster {
                        hitpoints: new_hitpoints,
                        ..monster_body
                    };
                    ctx.replace(&monster, &monster_body).await?;
                }
                Ok::<(), OperationError>(())
            }
        })
        .await
        .map(|result| {
            println!(
                "  transaction {} committed after {} attempt(s)",
                result.transaction_id, result.attempts
            );
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Player Hits Monster ===\n");

    let store = Arc::new(MemoryStore::new().with_replicas(2));
    let collection = Collection::new("game", store.clone());
    println!("✓ Created in-memory collection 'game'");

    let player = Player {
        experience: 40,
        hitpoints: 100,
        logged_in: true,
        level: 0,
        name: "Jane".into(),
        uuid: "player-jane".into(),
    };
    let monster = Monster {
        experience_when_killed: 90,
        hitpoints: 25,
        name: "Bob the Troll".into(),
        uuid: "monster-bob".into(),
    };
    collection
        .insert("player-jane", serde_json::to_vec(&player)?)
        .await?;
    collection
        .insert("monster-bob", serde_json::to_vec(&monster)?)
        .await?;
    println!("✓ Seeded player and monster");

    let config = TransactionConfig::default()
        .with_durability_level(Durability::PersistToMajority)
        .with_expiration_time(Duration::from_secs(120))
        .with_cleanup_window(Duration::from_secs(120));
    let transactions = Transactions::new(config)?;
    transactions.register_collection(&collection);
    println!("✓ Started transactions\n");

    for round in 1..=3 {
        println!("Round {}: Jane hits Bob for 10", round);
        if let Err(e) =
            player_hits_monster(&transactions, &collection, 10, "player-jane", "monster-bob").await
        {
            println!("  transaction did not reach commit point: {}", e);
        }
    }

    let jane: Player = serde_json::from_slice(
        collection
            .get("player-jane")
            .await?
            .body
            .as_deref()
            .unwrap_or_default(),
    )?;
    println!(
        "\nJane now has {} experience and is level {}",
        jane.experience, jane.level
    );
    println!(
        "Bob is {}",
        if collection.get("monster-bob").await.is_ok() {
            "still standing"
        } else {
            "gone"
        }
    );

    transactions.close().await;
    println!("\n✓ Cleanup stopped");
    Ok(())
}

use anyhow::{anyhow, Context, Result};
use bazaar_chat::{
    ChatSession, Message, OfferExtra, OfferStatus, SessionConfig, SessionNotice, SessionView,
};
use bazaar_store::{Backend, Fixture};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_FIXTURE: &str = r#"{
    "profiles": [
        { "id": "buyer-1", "displayName": "Ayşe" },
        { "id": "seller-1", "displayName": "Mehmet" }
    ],
    "listings": [
        {
            "id": "listing-1", "sellerId": "seller-1", "title": "Camping van",
            "basePrice": 100.0, "dailySurcharge": 20.0, "sold": false
        }
    ],
    "chats": [
        { "id": "chat-1", "buyerId": "buyer-1", "sellerId": "seller-1", "listingId": "listing-1" }
    ]
}"#;

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted buyer/seller negotiation", long_about = None)]
struct Args {
    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed data file (JSON); a built-in chat is used when omitted
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    /// Chat to negotiate in
    #[arg(long, default_value = "chat-1")]
    chat: String,

    /// Offer duration in days
    #[arg(short, long, default_value = "3")]
    days: u32,

    /// Offer extra as ID:LABEL:PRICE, may be repeated
    #[arg(short, long, value_parser = parse_extra)]
    extra: Vec<OfferExtra>,

    /// Seller devices racing to accept the offer
    #[arg(long, default_value = "2")]
    devices: usize,

    /// Override the reconciliation poll interval (seconds)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Override the typing idle timeout (milliseconds)
    #[arg(long)]
    typing_idle: Option<u64>,

    /// Cut the realtime channel before the offer is sent
    #[arg(long)]
    drop_realtime: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    chat_id: String,
    listing_sold: bool,
    offer_status: Option<OfferStatus>,
    messages: Vec<Message>,
    notifications: usize,
}

fn parse_extra(s: &str) -> Result<OfferExtra, String> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(label), Some(price)) if !id.is_empty() => {
            let price: f64 = price
                .parse()
                .map_err(|e| format!("invalid price '{}': {}", price, e))?;
            Ok(OfferExtra::new(id, label, price))
        }
        _ => Err(format!("expected ID:LABEL:PRICE, got '{}'", s)),
    }
}

async fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if let Some(seconds) = args.poll_interval {
        config.poll_interval_seconds = seconds;
    }
    if let Some(millis) = args.typing_idle {
        config.typing_idle_millis = millis;
    }
    Ok(config)
}

async fn load_fixture(path: Option<&PathBuf>) -> Result<Fixture> {
    match path {
        Some(path) => Fixture::load(path)
            .await
            .with_context(|| format!("Failed to load fixture {}", path.display())),
        None => Ok(Fixture::from_json(DEMO_FIXTURE)?),
    }
}

async fn wait_for(
    session: &ChatSession,
    what: &str,
    predicate: impl Fn(&SessionView) -> bool,
) -> Result<SessionView> {
    let mut view = session.watch();
    let matched = tokio::time::timeout(WAIT_TIMEOUT, async {
        view.wait_for(|v| predicate(v))
            .await
            .map(|v| (*v).clone())
            .map_err(|_| anyhow!("session closed while waiting for {}", what))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {}", what))??;
    Ok(matched)
}

fn print_notices(name: String, mut notices: UnboundedReceiver<SessionNotice>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                SessionNotice::SendFailed { text, reason } => {
                    println!("[{}] ✗ send failed ({}), draft: {:?}", name, reason, text)
                }
                SessionNotice::AlreadySold { message_id } => {
                    println!("[{}] ✗ {} lost, the listing is already sold", name, message_id)
                }
                SessionNotice::OfferSettled { message_id, status } => {
                    println!("[{}] ✓ offer {} {}", name, message_id, status)
                }
            }
        }
    });
}

fn print_transcript(view: &SessionView) {
    println!("\n=== {} ({}) ===", view.listing.title, view.chat.id);
    for message in &view.messages {
        let who = if message.sender_id == view.chat.buyer_id {
            "buyer"
        } else {
            "seller"
        };
        let read = if message.read_at.is_some() { "✓✓" } else { "✓" };
        match &message.offer {
            Some(offer) => println!(
                "{} {:>6}: {} [{}] {}",
                message.created_at.format("%H:%M:%S"),
                who,
                message.content,
                offer.status,
                read
            ),
            None => println!(
                "{} {:>6}: {} {}",
                message.created_at.format("%H:%M:%S"),
                who,
                message.content,
                read
            ),
        }
    }
    println!(
        "Listing {}",
        if view.listing.sold { "SOLD" } else { "available" }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args = Args::parse();
    let config = load_config(&args).await?;
    let fixture = load_fixture(args.fixture.as_ref()).await?;
    let chat = fixture
        .chats
        .iter()
        .find(|c| c.id == args.chat)
        .cloned()
        .ok_or_else(|| anyhow!("Chat {} is not in the fixture", args.chat))?;

    let backend = Backend::from_fixture(fixture);
    info!("Negotiating in {} over {}", chat.id, chat.listing_id);

    let (buyer, buyer_notices) =
        ChatSession::open(&chat.id, &chat.buyer_id, backend.deps(), config.clone()).await?;
    let (seller, seller_notices) =
        ChatSession::open(&chat.id, &chat.seller_id, backend.deps(), config.clone()).await?;
    print_notices("buyer".to_string(), buyer_notices);
    print_notices("seller-1".to_string(), seller_notices);

    for draft in ["Mer", "Merhaba", "Merhaba, hâlâ müsait mi?"] {
        buyer.input_changed(draft)?;
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    let greeting = buyer.send_message("Merhaba, hâlâ müsait mi?").await?;
    wait_for(&seller, "the greeting", |v| v.message(&greeting.id).is_some()).await?;
    seller.send_message("Evet, müsait. Kaç gün düşünüyorsunuz?").await?;

    if args.drop_realtime {
        let dropped = backend.hub.drop_subscriptions(&chat.id);
        println!("Dropped {} realtime subscriptions", dropped);
    }

    let offer = buyer.send_offer(args.days, args.extra.clone()).await?;
    println!("Buyer sent: {}", offer.content);
    wait_for(&seller, "the offer", |v| v.message(&offer.id).is_some()).await?;

    let mut devices = Vec::new();
    for n in 2..=args.devices.max(1) {
        let (device, notices) =
            ChatSession::open(&chat.id, &chat.seller_id, backend.deps(), config.clone()).await?;
        print_notices(format!("seller-{}", n), notices);
        wait_for(&device, "the offer", |v| v.message(&offer.id).is_some()).await?;
        devices.push(device);
    }

    let results = futures::future::join_all(
        std::iter::once(&seller)
            .chain(devices.iter())
            .map(|device| device.accept_offer(&offer.id)),
    )
    .await;
    for (n, result) in results.into_iter().enumerate() {
        match result {
            Ok(_) => println!("seller device {} won the sale", n + 1),
            Err(e) => println!("seller device {} lost: {}", n + 1, e),
        }
    }
    for device in &devices {
        device.close().await;
    }

    let view = wait_for(&buyer, "the sale", |v| v.listing.sold).await?;
    print_transcript(&view);

    let notifications = backend.notifications.delivered();
    println!("\nNotifications:");
    for notification in &notifications {
        println!(
            "  → {} [{:?}] {}: {}",
            notification.user_id, notification.kind, notification.title, notification.body
        );
    }

    let summary = Summary {
        chat_id: chat.id.clone(),
        listing_sold: view.listing.sold,
        offer_status: view.message(&offer.id).and_then(|m| m.offer_status()),
        messages: view.messages.clone(),
        notifications: notifications.len(),
    };
    println!("\n{}", serde_json::to_string_pretty(&summary)?);

    buyer.close().await;
    seller.close().await;
    Ok(())
}

use chrono::{Duration, TimeZone, Utc};
use clap::Args;
use docrelay::clock::ManualClock;
use docrelay::config::{RealtimeConfig, RelayConfig};
use docrelay::error::AppError;
use docrelay::relay::{DocumentDescriptor, JobPriority, JobStatus, LocalRelayTransport, SubmitOptions};
use docrelay::submission::SubmissionReceipt;
use docrelay::tracking::{NotificationChannels, TrackingStage, UpdateContext};
use docrelay::AppContext;
use serde::Serialize;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Number of queue-advancement ticks to run after submission.
    #[arg(long, default_value_t = 6)]
    pub(crate) ticks: u32,
    /// Simulated seconds between ticks.
    #[arg(long, default_value_t = 30)]
    pub(crate) tick_seconds: i64,
    /// Skip the courier hand-off after dispatch.
    #[arg(long)]
    pub(crate) skip_courier: bool,
    /// Print the composed statistics as JSON at the end.
    #[arg(long)]
    pub(crate) statistics: bool,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            ticks: 6,
            tick_seconds: 30,
            skip_courier: false,
            statistics: false,
        }
    }
}

struct SampleDocument {
    descriptor: DocumentDescriptor,
    options: SubmitOptions,
}

fn sample_documents() -> Vec<SampleDocument> {
    let contact = NotificationChannels {
        sms: Some("+27820000001".to_string()),
        email: Some("applicant@example.test".to_string()),
    };
    vec![
        SampleDocument {
            descriptor: DocumentDescriptor {
                collection_location: Some("Home Affairs, Pretoria".to_string()),
                contact: contact.clone(),
                ..DocumentDescriptor::new("Passport", "P-2025-0001").held_by("Thandi Mokoena")
            },
            options: SubmitOptions::default(),
        },
        SampleDocument {
            descriptor: DocumentDescriptor {
                collection_location: Some("Home Affairs, Johannesburg".to_string()),
                contact,
                ..DocumentDescriptor::new("WorkPermit", "WP-2025-0042").held_by("Sipho Dlamini")
            },
            options: SubmitOptions {
                express: true,
                ..SubmitOptions::with_priority(JobPriority::High)
            },
        },
        SampleDocument {
            descriptor: DocumentDescriptor::new("CERTIFICATE", "BC-2025-0310")
                .held_by("Anele Nkosi"),
            options: SubmitOptions {
                delivery_method: Some("Courier".to_string()),
                ..SubmitOptions::with_priority(JobPriority::Low)
            },
        },
    ]
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let start = Utc
        .with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let clock = Arc::new(ManualClock::new(start));
    let context = AppContext::assemble(
        RelayConfig::default(),
        RealtimeConfig::default(),
        clock.clone(),
        Arc::new(LocalRelayTransport),
    );

    println!("Document relay demo");
    println!("Relay network:");
    for relay in context.scheduler.relays() {
        println!(
            "  - {} ({}) capacity {} rank {}",
            relay.id, relay.location, relay.capacity, relay.priority_rank
        );
    }

    let mut receipts = Vec::new();
    println!("\nSubmissions:");
    for sample in sample_documents() {
        let document_type = sample.descriptor.document_type.clone();
        let receipt = context
            .submissions
            .submit_for_printing_and_tracking(sample.descriptor, sample.options)
            .await?;
        println!(
            "  - {document_type}: job {} on {} (position {}), tracking {}, eta {}",
            receipt.job_id,
            receipt.relay_id,
            receipt.queue_position,
            receipt.tracking_number,
            receipt.estimated_completion.format("%Y-%m-%d %H:%M"),
        );
        receipts.push(receipt);
    }

    println!("\nQueue progression:");
    for tick in 1..=args.ticks {
        clock.advance(Duration::seconds(args.tick_seconds));
        let report = context.scheduler.advance_queues();
        let statuses = job_statuses(&context, &receipts)?;
        println!(
            "  tick {tick}: advanced {} completed {} | {}",
            report.advanced,
            report.completed,
            statuses.join(", ")
        );
    }

    if !args.skip_courier {
        println!("\nCourier hand-off:");
        for receipt in &receipts {
            if context.scheduler.get_job(&receipt.job_id)?.job.status != JobStatus::Dispatched {
                continue;
            }
            let destination = context
                .ledger
                .get_tracking(&receipt.tracking_number)?
                .record
                .collection
                .location
                .unwrap_or_else(|| "Post Office".to_string());
            context.ledger.update_status(
                &receipt.tracking_number,
                TrackingStage::InTransit,
                UpdateContext::at("Courier hub"),
            )?;
            let record = context.ledger.update_status(
                &receipt.tracking_number,
                TrackingStage::ReadyForCollection,
                UpdateContext::at(destination.clone()),
            )?;
            println!(
                "  - {} {} at {} ({}%)",
                record.tracking_number, record.current_stage, destination, record.progress_percentage
            );
        }
    }

    println!("\nTracking timelines:");
    for receipt in &receipts {
        let history = context.ledger.get_history(&receipt.tracking_number)?;
        let stages: Vec<String> = history
            .history
            .iter()
            .map(|entry| entry.stage.to_string())
            .collect();
        println!("  - {}: {}", receipt.tracking_number, stages.join(" -> "));
    }

    context.ledger.flush_notifications();
    let notifications = context.ledger.notifications();
    println!("\nNotifications sent: {}", notifications.len());
    for notification in notifications.iter().rev() {
        println!("  - {}", notification.message);
    }

    if args.statistics {
        println!("\nStatistics:");
        print_json(&context.statistics()?);
    }

    Ok(())
}

fn job_statuses(
    context: &AppContext,
    receipts: &[SubmissionReceipt],
) -> Result<Vec<String>, AppError> {
    receipts
        .iter()
        .map(|receipt| {
            let details = context.scheduler.get_job(&receipt.job_id)?;
            Ok(format!("{} {}", receipt.job_id, details.job.status))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("failed to render statistics: {err}"),
    }
}

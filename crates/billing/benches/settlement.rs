use chrono::{Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rust_decimal::Decimal;

use hap_billing::{Payment, PaymentMethod, settle};
use hap_core::{InvoiceId, PaymentId};

fn ledger(invoice_id: InvoiceId, len: usize) -> Vec<Payment> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let method = PaymentMethod::parse("card").unwrap();

    // Reverse chronological so the sort does real work.
    (0..len)
        .map(|i| Payment {
            id: PaymentId::new(),
            invoice_id,
            amount: Decimal::new(1_000, 2),
            method: method.clone(),
            paid_at: start + Duration::minutes((len - i) as i64),
            notes: String::new(),
        })
        .collect()
}

fn bench_settle(c: &mut Criterion) {
    let mut group = c.benchmark_group("settle");
    let invoice_id = InvoiceId::new();

    for len in [10usize, 100, 1_000, 10_000] {
        let payments = ledger(invoice_id, len);
        let amount = Decimal::new(1_000 * len as i64 / 2, 2);

        group.bench_with_input(BenchmarkId::from_parameter(len), &payments, |b, payments| {
            b.iter(|| settle(black_box(amount), black_box(payments)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_settle);
criterion_main!(benches);

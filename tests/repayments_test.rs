mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{date, repay, repay_with, test_service, Borrower};
use microlend::application::{AppError, NewRepayment, RepaymentFilter, RepaymentUpdate};
use microlend::domain::{LoanStatus, PaymentMode};

#[tokio::test]
async fn test_full_repayment_closes_loan() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    // 10000.00 at 10% => 11000.00 due
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let result = repay(&service, &loan, 1_100_000).await?;

    assert_eq!(result.previous_status, LoanStatus::Active);
    assert_eq!(result.loan.status, LoanStatus::Closed);
    assert!(result.status_changed());
    assert_eq!(result.summary.total_due, 1_100_000);
    assert_eq!(result.summary.remaining_balance, 0);

    let summary = service.loan_summary(loan.id).await?;
    assert_eq!(summary.status, LoanStatus::Closed);
    assert_eq!(summary.total_repaid, 1_100_000);
    assert_eq!(summary.remaining_balance, 0);

    Ok(())
}

#[tokio::test]
async fn test_partial_repayments_accumulate_until_closure() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let first = repay(&service, &loan, 500_000).await?;
    assert_eq!(first.loan.status, LoanStatus::Active);
    assert_eq!(first.summary.remaining_balance, 600_000);

    let second = repay(&service, &loan, 500_000).await?;
    assert_eq!(second.loan.status, LoanStatus::Active);
    assert_eq!(second.summary.remaining_balance, 100_000);

    let third = repay(&service, &loan, 100_000).await?;
    assert_eq!(third.loan.status, LoanStatus::Closed);
    assert_eq!(third.summary.total_repaid, 1_100_000);

    Ok(())
}

#[tokio::test]
async fn test_overpayment_within_tolerance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    // 5000.00 at 12% => 5600.00 due, limit 6160.00
    let loan = borrower.loan(&service, 500_000, 1200, 24).await?;

    let err = repay(&service, &loan, 620_000).await.unwrap_err();
    match err.downcast_ref::<AppError>() {
        Some(AppError::AmountExceedsLimit {
            amount,
            outstanding,
            limit,
        }) => {
            assert_eq!(*amount, 620_000);
            assert_eq!(*outstanding, 560_000);
            assert_eq!(*limit, 616_000);
        }
        other => panic!("expected AmountExceedsLimit, got {:?}", other),
    }

    // Exactly the limit is accepted
    let result = repay(&service, &loan, 616_000).await?;
    assert_eq!(result.loan.status, LoanStatus::Closed);
    assert_eq!(result.summary.outstanding, -56_000);
    assert_eq!(result.summary.remaining_balance, 0);

    Ok(())
}

#[tokio::test]
async fn test_limit_uses_remaining_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &loan, 1_000_000).await?;

    // 1000.00 outstanding, limit 1100.00
    let err = repay(&service, &loan, 110_001).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::AmountExceedsLimit { .. })
    ));
    assert_eq!(service.loan_summary(loan.id).await?.total_repaid, 1_000_000);

    Ok(())
}

#[tokio::test]
async fn test_repayment_rejected_for_inactive_loans() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    let closed = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    repay(&service, &closed, 1_100_000).await?;

    let defaulted = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    service
        .set_loan_status(defaulted.id, LoanStatus::Defaulted)
        .await?;

    for (loan, status) in [
        (&closed, LoanStatus::Closed),
        (&defaulted, LoanStatus::Defaulted),
    ] {
        for amount in [1, 100_000, 10_000_000] {
            let err = repay(&service, loan, amount).await.unwrap_err();
            match err.downcast_ref::<AppError>() {
                Some(AppError::InvalidLoanState { status: s, .. }) => assert_eq!(*s, status),
                other => panic!("expected InvalidLoanState, got {:?}", other),
            }
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_repayment_input_validation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let err = repay(&service, &loan, 0).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));

    let err = repay(&service, &loan, -500).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));

    // Below 1.00 is refused while the balance is larger
    let err = repay(&service, &loan, 99).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));
    repay(&service, &loan, 100).await?;

    // Today is accepted, tomorrow is not
    repay_with(&service, &loan, 10_000, PaymentMode::Bank, "2025-06-15").await?;
    let err = repay_with(&service, &loan, 10_000, PaymentMode::Bank, "2025-06-16")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::PaymentDateInFuture { .. })
    ));

    let err = service
        .post_repayment(NewRepayment {
            loan_id: loan.id,
            amount_cents: 10_000,
            payment_date: date("2025-06-10"),
            payment_mode: PaymentMode::Cash,
            reference: Some("R".repeat(256)),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = service
        .post_repayment(NewRepayment {
            loan_id: uuid::Uuid::new_v4(),
            amount_cents: 10_000,
            payment_date: date("2025-06-10"),
            payment_mode: PaymentMode::Cash,
            reference: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::LoanNotFound(_)));

    Ok(())
}

#[tokio::test]
async fn test_final_payment_under_minimum_closes_loan() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &loan, 1_099_960).await?;
    let err = repay(&service, &loan, 30).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::InvalidAmount(_))
    ));

    let closing = repay(&service, &loan, 40).await?;
    assert_eq!(closing.loan.status, LoanStatus::Closed);
    assert_eq!(closing.summary.remaining_balance, 0);

    Ok(())
}

#[tokio::test]
async fn test_delete_repayment_reopens_closed_loan() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &loan, 600_000).await?;
    let closing = repay(&service, &loan, 500_000).await?;
    assert_eq!(closing.loan.status, LoanStatus::Closed);

    let deleted = service.delete_repayment(closing.repayment.id).await?;
    assert_eq!(deleted.previous_status, LoanStatus::Closed);
    assert_eq!(deleted.loan.status, LoanStatus::Active);
    assert_eq!(deleted.summary.total_repaid, 600_000);
    assert_eq!(deleted.summary.remaining_balance, 500_000);

    assert_eq!(service.get_loan(loan.id).await?.status, LoanStatus::Active);
    assert!(matches!(
        service.get_repayment(closing.repayment.id).await,
        Err(AppError::RepaymentNotFound(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_delete_repayment_keeps_closed_when_still_covered() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &loan, 1_000_000).await?;
    let small = repay(&service, &loan, 5_000).await?;
    // 950.00 outstanding, overpaid up to the 1045.00 limit
    let closing = repay(&service, &loan, 104_500).await?;
    assert_eq!(closing.loan.status, LoanStatus::Closed);
    assert_eq!(closing.summary.total_repaid, 1_109_500);

    let deleted = service.delete_repayment(small.repayment.id).await?;
    assert_eq!(deleted.summary.total_repaid, 1_104_500);
    assert_eq!(deleted.loan.status, LoanStatus::Closed);
    assert!(!deleted.status_changed());

    Ok(())
}

#[tokio::test]
async fn test_delete_repayment_leaves_defaulted_loan() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let posted = repay(&service, &loan, 300_000).await?;
    service
        .set_loan_status(loan.id, LoanStatus::Defaulted)
        .await?;

    let deleted = service.delete_repayment(posted.repayment.id).await?;
    assert_eq!(deleted.loan.status, LoanStatus::Defaulted);
    assert_eq!(
        service.get_loan(loan.id).await?.status,
        LoanStatus::Defaulted
    );

    Ok(())
}

#[tokio::test]
async fn test_update_repayment_reconciles_status() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let first = repay(&service, &loan, 600_000).await?;
    let second = repay(&service, &loan, 500_000).await?;
    assert_eq!(second.loan.status, LoanStatus::Closed);

    // Lowering a payment reopens
    let lowered = service
        .update_repayment(
            second.repayment.id,
            RepaymentUpdate {
                amount_cents: Some(400_000),
                ..RepaymentUpdate::default()
            },
        )
        .await?;
    assert_eq!(lowered.loan.status, LoanStatus::Active);
    assert_eq!(lowered.summary.remaining_balance, 100_000);

    // Raising one closes again
    let raised = service
        .update_repayment(
            first.repayment.id,
            RepaymentUpdate {
                amount_cents: Some(700_000),
                payment_mode: Some(PaymentMode::Mobile),
                reference: Some("TX-77".into()),
                ..RepaymentUpdate::default()
            },
        )
        .await?;
    assert_eq!(raised.loan.status, LoanStatus::Closed);
    assert_eq!(raised.repayment.payment_mode, PaymentMode::Mobile);
    assert_eq!(raised.repayment.reference.as_deref(), Some("TX-77"));

    let stored = service.get_repayment(first.repayment.id).await?;
    assert_eq!(stored.amount_cents, 700_000);

    Ok(())
}

#[tokio::test]
async fn test_update_repayment_checks_limit_and_defaulted() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let posted = repay(&service, &loan, 100_000).await?;

    // Outstanding without this payment is 11000.00, limit 12100.00
    let err = service
        .update_repayment(
            posted.repayment.id,
            RepaymentUpdate {
                amount_cents: Some(1_210_001),
                ..RepaymentUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AmountExceedsLimit { .. }));

    let err = service
        .update_repayment(
            posted.repayment.id,
            RepaymentUpdate {
                amount_cents: Some(50),
                ..RepaymentUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidAmount(_)));
    assert_eq!(service.get_repayment(posted.repayment.id).await?.amount_cents, 100_000);

    let err = service
        .update_repayment(
            posted.repayment.id,
            RepaymentUpdate {
                payment_date: Some(date("2025-07-01")),
                ..RepaymentUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentDateInFuture { .. }));

    service
        .set_loan_status(loan.id, LoanStatus::Defaulted)
        .await?;
    let err = service
        .update_repayment(
            posted.repayment.id,
            RepaymentUpdate {
                amount_cents: Some(50_000),
                ..RepaymentUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidLoanState {
            status: LoanStatus::Defaulted,
            ..
        }
    ));
    assert_eq!(
        service.get_repayment(posted.repayment.id).await?.amount_cents,
        100_000
    );

    Ok(())
}

#[tokio::test]
async fn test_list_repayments_filters() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan_a = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let loan_b = borrower.loan(&service, 2_000_000, 1500, 24).await?;

    repay_with(&service, &loan_a, 100_000, PaymentMode::Cash, "2025-05-02").await?;
    repay_with(&service, &loan_a, 100_000, PaymentMode::Mobile, "2025-06-02").await?;
    repay_with(&service, &loan_b, 200_000, PaymentMode::Bank, "2025-06-05").await?;

    let all = service.list_repayments(&RepaymentFilter::default()).await?;
    assert_eq!(all.len(), 3);
    // Newest payment date first
    assert_eq!(all[0].payment_date, date("2025-06-05"));

    let by_loan = service
        .list_repayments(&RepaymentFilter {
            loan_id: Some(loan_a.id),
            ..RepaymentFilter::default()
        })
        .await?;
    assert_eq!(by_loan.len(), 2);

    let by_mode = service
        .list_repayments(&RepaymentFilter {
            payment_mode: Some(PaymentMode::Bank),
            ..RepaymentFilter::default()
        })
        .await?;
    assert_eq!(by_mode.len(), 1);
    assert_eq!(by_mode[0].loan_id, loan_b.id);

    let june = service
        .list_repayments(&RepaymentFilter {
            from_date: Some(date("2025-06-01")),
            to_date: Some(date("2025-06-30")),
            limit: Some(1),
            ..RepaymentFilter::default()
        })
        .await?;
    assert_eq!(june.len(), 1);

    let history = service.loan_repayments(loan_a.id).await?;
    assert_eq!(history.repayments.len(), 2);
    assert_eq!(history.summary.total_repaid, 200_000);
    assert_eq!(history.summary.remaining_balance, 900_000);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_repayments_never_overshoot() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let service = Arc::new(service);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = Arc::clone(&service);
        let loan_id = loan.id;
        handles.push(tokio::spawn(async move {
            service
                .post_repayment(NewRepayment {
                    loan_id,
                    amount_cents: 100_000,
                    payment_date: date("2025-06-10"),
                    payment_mode: PaymentMode::Cash,
                    reference: None,
                })
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(AppError::InvalidLoanState { status, .. }) => {
                assert_eq!(status, LoanStatus::Closed)
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    // 11 payments of 1000.00 cover 11000.00, the rest find the loan closed
    assert_eq!(succeeded, 11);
    let summary = service.loan_summary(loan.id).await?;
    assert_eq!(summary.total_repaid, 1_100_000);
    assert_eq!(summary.status, LoanStatus::Closed);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_repayments_across_loans() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let mut loans = Vec::new();
    for _ in 0..20 {
        loans.push(borrower.loan(&service, 1_000_000, 1000, 12).await?);
    }
    let service = Arc::new(service);

    for _ in 0..5 {
        let mut handles = Vec::new();
        for loan in &loans {
            let service = Arc::clone(&service);
            let loan_id = loan.id;
            handles.push(tokio::spawn(async move {
                service
                    .post_repayment(NewRepayment {
                        loan_id,
                        amount_cents: 10_000,
                        payment_date: date("2025-06-10"),
                        payment_mode: PaymentMode::Mobile,
                        reference: None,
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }
    }

    for loan in &loans {
        let summary = service.loan_summary(loan.id).await?;
        assert_eq!(summary.total_repaid, 50_000);
        assert_eq!(summary.status, LoanStatus::Active);
    }
    let all = service.list_repayments(&RepaymentFilter::default()).await?;
    assert_eq!(all.len(), 100);

    Ok(())
}

mod common;

use anyhow::Result;
use common::{date, repay, test_service, Borrower};
use microlend::application::{AppError, LoanFilter, LoanTermsUpdate, NewLoan};
use microlend::domain::{LoanStatus, TermsError};

#[tokio::test]
async fn test_create_loan_is_active() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    let loan = borrower.loan(&service, 1_000_000, 1250, 12).await?;
    assert_eq!(loan.status, LoanStatus::Active);
    assert_eq!(loan.client_id, borrower.client.id);
    assert_eq!(loan.branch_id, borrower.branch.id);

    let stored = service.get_loan(loan.id).await?;
    assert_eq!(stored.principal_cents, 1_000_000);
    assert_eq!(stored.rate_bps, 1250);
    assert_eq!(stored.tenure_months, 12);
    assert_eq!(stored.issue_date, date("2025-06-01"));

    Ok(())
}

#[tokio::test]
async fn test_create_loan_validates_terms() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    let cases = [
        (99_999, 1000, 12),
        (100_000_001, 1000, 12),
        (1_000_000, -1, 12),
        (1_000_000, 5001, 12),
        (1_000_000, 1000, 0),
        (1_000_000, 1000, 121),
    ];
    for (principal, rate, tenure) in cases {
        let err = borrower
            .loan(&service, principal, rate, tenure)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<AppError>(),
                Some(AppError::InvalidLoanTerms(_))
            ),
            "terms {} / {} / {} should be rejected",
            principal,
            rate,
            tenure
        );
    }

    // Boundaries are inclusive
    borrower.loan(&service, 100_000, 0, 1).await?;
    borrower.loan(&service, 100_000_000, 5000, 120).await?;

    Ok(())
}

#[tokio::test]
async fn test_create_loan_requires_client_and_branch() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    let err = service
        .create_loan(NewLoan {
            client_id: uuid::Uuid::new_v4(),
            branch_id: borrower.branch.id,
            principal_cents: 1_000_000,
            rate_bps: 1000,
            tenure_months: 12,
            issue_date: date("2025-06-01"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ClientNotFound(_)));

    let err = service
        .create_loan(NewLoan {
            client_id: borrower.client.id,
            branch_id: uuid::Uuid::new_v4(),
            principal_cents: 1_000_000,
            rate_bps: 1000,
            tenure_months: 12,
            issue_date: date("2025-06-01"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BranchNotFound(_)));

    Ok(())
}

#[tokio::test]
async fn test_update_loan_terms() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let updated = service
        .update_loan_terms(
            loan.id,
            LoanTermsUpdate {
                rate_bps: Some(1500),
                tenure_months: Some(18),
                ..LoanTermsUpdate::default()
            },
        )
        .await?;
    assert_eq!(updated.principal_cents, 1_000_000);
    assert_eq!(updated.rate_bps, 1500);
    assert_eq!(updated.tenure_months, 18);
    assert_eq!(service.loan_summary(loan.id).await?.total_due, 1_150_000);

    let err = service
        .update_loan_terms(
            loan.id,
            LoanTermsUpdate {
                tenure_months: Some(0),
                ..LoanTermsUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidLoanTerms(TermsError::TenureOutOfRange(0))
    ));
    // Rejected update leaves terms untouched
    assert_eq!(service.get_loan(loan.id).await?.tenure_months, 18);

    Ok(())
}

#[tokio::test]
async fn test_lowering_terms_can_close_loan() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &loan, 1_000_000).await?;
    let updated = service
        .update_loan_terms(
            loan.id,
            LoanTermsUpdate {
                rate_bps: Some(0),
                ..LoanTermsUpdate::default()
            },
        )
        .await?;
    assert_eq!(updated.status, LoanStatus::Closed);

    Ok(())
}

#[tokio::test]
async fn test_update_terms_refused_unless_active() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    repay(&service, &loan, 1_100_000).await?;

    let err = service
        .update_loan_terms(
            loan.id,
            LoanTermsUpdate {
                principal_cents: Some(2_000_000),
                ..LoanTermsUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidLoanState {
            status: LoanStatus::Closed,
            ..
        }
    ));

    Ok(())
}

#[tokio::test]
async fn test_status_override() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    let defaulted = service
        .set_loan_status(loan.id, LoanStatus::Defaulted)
        .await?;
    assert_eq!(defaulted.status, LoanStatus::Defaulted);

    // Setting the same status is a no-op
    let again = service
        .set_loan_status(loan.id, LoanStatus::Defaulted)
        .await?;
    assert_eq!(again.status, LoanStatus::Defaulted);

    let reactivated = service.set_loan_status(loan.id, LoanStatus::Active).await?;
    assert_eq!(reactivated.status, LoanStatus::Active);
    repay(&service, &loan, 100_000).await?;

    assert!(matches!(
        service
            .set_loan_status(uuid::Uuid::new_v4(), LoanStatus::Closed)
            .await,
        Err(AppError::LoanNotFound(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_delete_loan_restricted_by_repayments() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let paid = borrower.loan(&service, 1_000_000, 1000, 12).await?;
    let unpaid = borrower.loan(&service, 1_000_000, 1000, 12).await?;

    repay(&service, &paid, 100_000).await?;
    let err = service.delete_loan(paid.id).await.unwrap_err();
    assert!(matches!(err, AppError::HasDependents { .. }));

    service.delete_loan(unpaid.id).await?;
    assert!(matches!(
        service.get_loan(unpaid.id).await,
        Err(AppError::LoanNotFound(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_list_loans_filters() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;

    let older = borrower
        .loan_on(&service, 1_000_000, 1000, 12, "2025-03-01")
        .await?;
    let newer = borrower
        .loan_on(&service, 2_000_000, 1000, 12, "2025-06-01")
        .await?;
    repay(&service, &older, 1_100_000).await?;

    let all = service.list_loans(&LoanFilter::default()).await?;
    assert_eq!(all.len(), 2);
    // Newest issue date first
    assert_eq!(all[0].id, newer.id);

    let closed = service
        .list_loans(&LoanFilter {
            status: Some(LoanStatus::Closed),
            ..LoanFilter::default()
        })
        .await?;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].id, older.id);

    let spring = service
        .list_loans(&LoanFilter {
            from_date: Some(date("2025-02-01")),
            to_date: Some(date("2025-04-30")),
            ..LoanFilter::default()
        })
        .await?;
    assert_eq!(spring.len(), 1);

    assert_eq!(service.loans_by_client(borrower.client.id).await?.len(), 2);
    assert_eq!(service.loans_by_branch(borrower.branch.id).await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_loan_details_and_preview() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let borrower = Borrower::create(&service).await?;
    let loan = borrower.loan(&service, 1_000_000, 1200, 12).await?;
    repay(&service, &loan, 200_000).await?;

    let details = service.get_loan_details(loan.id).await?;
    assert_eq!(details.repayments.len(), 1);
    assert_eq!(details.summary.total_due, 1_120_000);
    assert_eq!(details.summary.remaining_balance, 920_000);
    assert_eq!(details.installment, Some(88_849));
    assert_eq!(details.client.map(|c| c.name), Some("Amina".to_string()));
    assert_eq!(details.branch.map(|b| b.name), Some("Central".to_string()));

    // Zero-rate branch divides evenly
    assert_eq!(service.installment_preview(1_200_000, 0, 12)?, 100_000);
    assert!(matches!(
        service.installment_preview(1_200_000, 0, 0),
        Err(AppError::Validation(_))
    ));

    Ok(())
}

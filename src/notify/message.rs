use std::fmt::{self, Write};

use crate::domain::{format_cents, format_rate};

use super::{EmailMessage, MailConfig, RepaymentPosted};

/// Work out who receives a confirmation.
///
/// The client is the primary recipient and the admin address is copied.
/// Without a client email the admin address becomes the primary recipient.
/// Returns None when there is nobody to send to.
pub fn resolve_recipients(
    client_email: Option<&str>,
    cc_address: Option<&str>,
) -> Option<(Vec<String>, Vec<String>)> {
    let client_email = client_email.filter(|e| !e.trim().is_empty());
    let cc_address = cc_address.filter(|e| !e.trim().is_empty());

    match (client_email, cc_address) {
        (Some(to), Some(cc)) => Some((vec![to.to_string()], vec![cc.to_string()])),
        (Some(to), None) => Some((vec![to.to_string()], Vec::new())),
        (None, Some(cc)) => Some((vec![cc.to_string()], Vec::new())),
        (None, None) => None,
    }
}

pub fn confirmation_subject(reference: Option<&str>) -> String {
    format!(
        "Loan Repayment Confirmation - Reference: {}",
        reference.unwrap_or("N/A")
    )
}

/// Render the confirmation message for a posted repayment.
/// Returns None when no recipient can be resolved.
pub fn render_confirmation(event: &RepaymentPosted, config: &MailConfig) -> Option<EmailMessage> {
    let (to, cc) = resolve_recipients(event.client.email.as_deref(), config.cc_address.as_deref())?;

    let mut body = String::new();
    write_body(&mut body, event).ok()?;

    Some(EmailMessage {
        from: format!("{} <{}>", config.from_name, config.from_address),
        to,
        cc,
        subject: confirmation_subject(event.repayment.reference.as_deref()),
        body,
    })
}

fn write_body(out: &mut impl Write, event: &RepaymentPosted) -> fmt::Result {
    let RepaymentPosted {
        loan,
        repayment,
        client,
        branch,
        summary,
    } = event;

    writeln!(out, "Dear {},", client.name)?;
    writeln!(out)?;
    writeln!(out, "We have received your loan repayment.")?;
    writeln!(out)?;
    writeln!(out, "Payment details")?;
    writeln!(out, "  Amount paid:    {}", format_cents(repayment.amount_cents))?;
    writeln!(out, "  Payment date:   {}", repayment.payment_date)?;
    writeln!(out, "  Payment mode:   {}", repayment.payment_mode)?;
    writeln!(
        out,
        "  Reference:      {}",
        repayment.reference.as_deref().unwrap_or("N/A")
    )?;
    writeln!(out)?;
    writeln!(out, "Loan details")?;
    writeln!(out, "  Loan ID:        {}", loan.id)?;
    writeln!(out, "  Principal:      {}", format_cents(loan.principal_cents))?;
    writeln!(out, "  Interest rate:  {}%", format_rate(loan.rate_bps))?;
    writeln!(out, "  Tenure:         {} months", loan.tenure_months)?;
    writeln!(out, "  Loan status:    {}", summary.status)?;
    if let Some(branch) = branch {
        writeln!(out, "  Branch:         {}", branch.name)?;
    }
    writeln!(out)?;
    writeln!(out, "Updated loan balance")?;
    writeln!(out, "  Total due:      {}", format_cents(summary.total_due))?;
    writeln!(out, "  Total repaid:   {}", format_cents(summary.total_repaid))?;
    writeln!(
        out,
        "  Remaining:      {}",
        format_cents(summary.remaining_balance)
    )?;
    if summary.is_fully_repaid() {
        writeln!(out)?;
        writeln!(out, "Congratulations! Your loan has been fully repaid.")?;
    }
    Ok(())
}

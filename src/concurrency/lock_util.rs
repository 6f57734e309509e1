use std::sync::Arc;

use crate::{
    concurrency::{LockContext, LockType},
    error::DbError,
    transaction::Transaction,
    types::DbResult,
};

/// Make the least-permissive set of lock changes so that `tx` can use
/// the resource at `ctx` with capability `need` (S, X or NL).
///
/// Ancestors get their intent locks first, then the target itself is
/// acquired, promoted or escalated, so the tree never passes through
/// an illegal intermediate state. Nothing happens when the effective
/// lock already covers the request.
pub fn ensure_sufficient(
    tx: &Arc<Transaction>,
    ctx: &Arc<LockContext>,
    need: LockType,
) -> DbResult {
    match need {
        LockType::NL => return Ok(()),
        LockType::S | LockType::X => {}
        _ => {
            return Err(DbError::InvalidLock(format!(
                "cannot request {} as a capability, use S, X or NL",
                need
            )))
        }
    }

    if ctx.effective_lock_type(tx).substitutes(need) {
        return Ok(());
    }

    // fix up the ancestors, outermost first
    for ancestor in ctx.ancestors_top_down() {
        let held = ancestor.explicit_lock_type(tx);
        match need {
            LockType::S => {
                if held == LockType::NL {
                    ancestor.acquire(tx, LockType::IS)?;
                }
            }
            LockType::X => match held {
                LockType::NL => ancestor.acquire(tx, LockType::IX)?,
                LockType::IS => ancestor.promote(tx, LockType::IX)?,
                LockType::S => ancestor.promote(tx, LockType::SIX)?,
                _ => {}
            },
            _ => unreachable!(),
        }
    }

    // then the target itself
    let held = ctx.explicit_lock_type(tx);
    match need {
        LockType::S => match held {
            LockType::NL => ctx.acquire(tx, LockType::S)?,
            LockType::IX => ctx.promote(tx, LockType::SIX)?,
            LockType::IS => ctx.escalate(tx)?,
            _ => {}
        },
        LockType::X => match held {
            LockType::NL => ctx.acquire(tx, LockType::X)?,
            LockType::S => ctx.promote(tx, LockType::X)?,
            LockType::IS | LockType::IX | LockType::SIX => {
                ctx.escalate(tx)?;
                if ctx.explicit_lock_type(tx) != LockType::X {
                    ctx.promote(tx, LockType::X)?;
                }
            }
            _ => {}
        },
        _ => unreachable!(),
    }

    Ok(())
}
